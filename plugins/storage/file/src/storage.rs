use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use satchel_api::{
    BagInfo, BagReader, BagWriter, ChannelDescriptor, MessageRecord, MetadataBuilder, StorageError,
    StorageOptions, StoragePort,
};

use crate::format::{DATA_EXT, DiskLine, METADATA_FILE, into_record};

// ════════════════════════════════════════════════════════════════
//  FileStorage
// ════════════════════════════════════════════════════════════════

/// Bag = директория с data-файлами `<bag>_<n>.jsonl` и `metadata.json`.
///
/// `uri` в [`StorageOptions`] задаёт путь к директории bag'а.
#[derive(Debug, Clone, Default)]
pub struct FileStorage;

impl FileStorage {
    pub fn new() -> Self {
        Self
    }
}

impl StoragePort for FileStorage {
    fn open_write(&self, options: &StorageOptions) -> Result<Box<dyn BagWriter>, StorageError> {
        let dir = PathBuf::from(&options.uri);
        if dir.exists() && !is_empty_dir(&dir)? {
            return Err(StorageError::AlreadyExists(options.uri.clone()));
        }
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::Io(e).with_context(format!("mkdir {}", dir.display())))?;
        let writer = FileWriter::create(dir, options.clone())?;
        Ok(Box::new(writer))
    }

    fn open_read(&self, options: &StorageOptions) -> Result<Box<dyn BagReader>, StorageError> {
        let dir = bag_dir(&options.uri)?;
        let reader = FileReader::open(&dir)?;
        Ok(Box::new(reader))
    }

    fn reconstruct_metadata(&self, options: &StorageOptions) -> Result<BagInfo, StorageError> {
        let dir = bag_dir(&options.uri)?;
        let files = data_files(&dir)?;
        tracing::info!(uri = %options.uri, files = files.len(), "reconstructing bag metadata");

        let mut meta = MetadataBuilder::new();
        for path in &files {
            meta.add_file(relative_name(path));
            scan_file(path, |line, _| {
                match line {
                    DiskLine::Channel {
                        name,
                        type_name,
                        serialization_format,
                    } => meta.add_channel(&ChannelDescriptor::new(name, type_name, serialization_format)),
                    message => {
                        if let Some(record) = into_record(message) {
                            meta.add_message(&record);
                        }
                    }
                }
            })?;
        }
        let info = meta.build(options);

        let out_dir = options.metadata_dir.clone().unwrap_or_else(|| dir.clone());
        std::fs::create_dir_all(&out_dir)
            .map_err(|e| StorageError::Io(e).with_context(format!("mkdir {}", out_dir.display())))?;
        write_metadata(&out_dir, &info)?;
        Ok(info)
    }

    fn describe(&self, uri: &str) -> Result<BagInfo, StorageError> {
        let dir = bag_dir(uri)?;
        let path = dir.join(METADATA_FILE);
        if !path.exists() {
            return Err(StorageError::MissingMetadata(uri.to_string()));
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| StorageError::Io(e).with_context(format!("read {}", path.display())))?;
        serde_json::from_str(&content).map_err(|e| StorageError::Corrupt {
            location: path.display().to_string(),
            detail: e.to_string(),
        })
    }
}

// ════════════════════════════════════════════════════════════════
//  Writer
// ════════════════════════════════════════════════════════════════

struct FileWriter {
    dir: PathBuf,
    /// Префикс имён data-файлов (имя директории bag'а).
    stem: String,
    options: StorageOptions,
    out: Option<BufWriter<File>>,
    file_index: usize,
    records_in_file: u64,
    /// Каналы в порядке объявления; повторяются в начале каждого нового файла.
    channels: Vec<ChannelDescriptor>,
    meta: MetadataBuilder,
}

impl FileWriter {
    fn create(dir: PathBuf, options: StorageOptions) -> Result<Self, StorageError> {
        let stem = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bag".to_string());
        let mut writer = Self {
            dir,
            stem,
            options,
            out: None,
            file_index: 0,
            records_in_file: 0,
            channels: Vec::new(),
            meta: MetadataBuilder::new(),
        };
        writer.open_file()?;
        Ok(writer)
    }

    fn open_file(&mut self) -> Result<(), StorageError> {
        let name = format!("{}_{}.{DATA_EXT}", self.stem, self.file_index);
        let path = self.dir.join(&name);
        let file = File::create(&path).map_err(|e| StorageError::Io(e).with_context(format!("create {}", path.display())))?;
        let mut out = BufWriter::new(file);
        for channel in &self.channels {
            writeln!(out, "{}", DiskLine::channel(channel).to_line()?)?;
        }
        self.out = Some(out);
        self.records_in_file = 0;
        self.meta.add_file(name);
        tracing::debug!(path = %path.display(), "data file opened");
        Ok(())
    }

    /// Закрыть текущий файл и начать следующий.
    fn split(&mut self) -> Result<(), StorageError> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
        }
        self.file_index += 1;
        self.open_file()
    }

    fn out(&mut self) -> Result<&mut BufWriter<File>, StorageError> {
        self.out.as_mut().ok_or(StorageError::Closed)
    }
}

impl BagWriter for FileWriter {
    fn create_channel(&mut self, channel: &ChannelDescriptor) -> Result<(), StorageError> {
        if self.channels.iter().any(|c| c.name == channel.name) {
            return Ok(());
        }
        let line = DiskLine::channel(channel).to_line()?;
        writeln!(self.out()?, "{line}")?;
        self.channels.push(channel.clone());
        self.meta.add_channel(channel);
        Ok(())
    }

    fn append(&mut self, record: &MessageRecord) -> Result<(), StorageError> {
        if !self.channels.iter().any(|c| c.name == record.channel) {
            return Err(StorageError::UnknownChannel(record.channel.clone()));
        }
        let max = self.options.max_records_per_file;
        if max > 0 && self.records_in_file >= max {
            self.split()?;
        }
        let line = DiskLine::message(record).to_line()?;
        writeln!(self.out()?, "{line}")?;
        self.records_in_file += 1;
        self.meta.add_message(record);
        Ok(())
    }

    fn close(&mut self) -> Result<BagInfo, StorageError> {
        let mut out = self.out.take().ok_or(StorageError::Closed)?;
        out.flush()?;
        out.get_ref().sync_all()?;
        let info = self.meta.build(&self.options);
        write_metadata(&self.dir, &info)?;
        tracing::info!(
            uri = %self.options.uri,
            messages = info.message_count,
            files = info.relative_file_paths.len(),
            "bag closed"
        );
        Ok(info)
    }
}

// ════════════════════════════════════════════════════════════════
//  Reader
// ════════════════════════════════════════════════════════════════

/// Позиция message-строки в data-файлах.
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    timestamp_ns: i64,
    file: usize,
    offset: u64,
}

/// Индекс по всем data-файлам, отсортированный по timestamp (stable: при
/// равных timestamp сохраняется порядок файлов и строк). Сами записи
/// читаются лениво, по одной.
struct FileReader {
    files: Vec<PathBuf>,
    handles: Vec<Option<BufReader<File>>>,
    channels: Vec<ChannelDescriptor>,
    index: Vec<IndexEntry>,
    cursor: usize,
}

impl FileReader {
    fn open(dir: &Path) -> Result<Self, StorageError> {
        let files = data_files(dir)?;
        if files.is_empty() {
            return Err(StorageError::NotFound(format!("no data files in {}", dir.display())));
        }

        let mut channels: Vec<ChannelDescriptor> = Vec::new();
        let mut index = Vec::new();
        for (file, path) in files.iter().enumerate() {
            scan_file(path, |line, offset| match line {
                DiskLine::Channel {
                    name,
                    type_name,
                    serialization_format,
                } => {
                    if !channels.iter().any(|c| c.name == name) {
                        channels.push(ChannelDescriptor::new(name, type_name, serialization_format));
                    }
                }
                DiskLine::Message { timestamp_ns, .. } => index.push(IndexEntry {
                    timestamp_ns,
                    file,
                    offset,
                }),
            })?;
        }
        index.sort_by_key(|e| e.timestamp_ns);
        tracing::debug!(dir = %dir.display(), records = index.len(), channels = channels.len(), "bag indexed");

        let handles = files.iter().map(|_| None).collect();
        Ok(Self {
            files,
            handles,
            channels,
            index,
            cursor: 0,
        })
    }

    fn read_at(&mut self, entry: IndexEntry) -> Result<MessageRecord, StorageError> {
        let path = &self.files[entry.file];
        if self.handles[entry.file].is_none() {
            let file = File::open(path).map_err(|e| StorageError::Io(e).with_context(format!("open {}", path.display())))?;
            self.handles[entry.file] = Some(BufReader::new(file));
        }
        let handle = self.handles[entry.file].as_mut().ok_or(StorageError::Closed)?;
        handle.seek(SeekFrom::Start(entry.offset))?;
        let mut line = String::new();
        handle.read_line(&mut line)?;
        let location = || format!("{}@{}", path.display(), entry.offset);
        let parsed = DiskLine::parse(line.trim_end(), location)?;
        into_record(parsed).ok_or_else(|| StorageError::Corrupt {
            location: location(),
            detail: "expected a message line".into(),
        })
    }
}

impl BagReader for FileReader {
    fn channels(&self) -> Vec<ChannelDescriptor> {
        self.channels.clone()
    }

    fn next_record(&mut self) -> Result<Option<MessageRecord>, StorageError> {
        let Some(entry) = self.index.get(self.cursor).copied() else {
            return Ok(None);
        };
        let record = self.read_at(entry)?;
        self.cursor += 1;
        Ok(Some(record))
    }

    fn rewind(&mut self) -> Result<(), StorageError> {
        self.cursor = 0;
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════
//  Helpers
// ════════════════════════════════════════════════════════════════

/// Директория bag'а; ошибка, если её нет или это не директория.
fn bag_dir(uri: &str) -> Result<PathBuf, StorageError> {
    let dir = PathBuf::from(uri);
    if !dir.is_dir() {
        return Err(StorageError::NotFound(uri.to_string()));
    }
    Ok(dir)
}

fn is_empty_dir(dir: &Path) -> Result<bool, StorageError> {
    if !dir.is_dir() {
        return Ok(false);
    }
    Ok(std::fs::read_dir(dir)?.next().is_none())
}

/// Data-файлы bag'а по порядку: сначала по номеру split'а, затем по имени.
fn data_files(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let mut files: Vec<(Option<u64>, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(DATA_EXT) {
            continue;
        }
        let split = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.rsplit_once('_'))
            .and_then(|(_, n)| n.parse().ok());
        files.push((split, path));
    }
    files.sort();
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

fn relative_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Пройти по строкам файла, передавая каждую разобранную строку и её
/// смещение. Оборванная последняя строка (запись прервалась на середине)
/// пропускается с предупреждением, любая другая битая строка даёт ошибку.
fn scan_file(path: &Path, mut on_line: impl FnMut(DiskLine, u64)) -> Result<(), StorageError> {
    let file = File::open(path).map_err(|e| StorageError::Io(e).with_context(format!("open {}", path.display())))?;
    let mut reader = BufReader::new(file);
    let mut offset = 0u64;
    let mut line_no = 0usize;
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        line_no += 1;
        let start = offset;
        offset += read as u64;

        let content = line.trim_end();
        if content.is_empty() {
            continue;
        }
        match DiskLine::parse(content, || format!("{}:{line_no}", path.display())) {
            Ok(parsed) => on_line(parsed, start),
            Err(e) if !line.ends_with('\n') => {
                tracing::warn!(path = %path.display(), line = line_no, error = %e, "skipping truncated last line");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn write_metadata(dir: &Path, info: &BagInfo) -> Result<(), StorageError> {
    let path = dir.join(METADATA_FILE);
    let json = serde_json::to_string_pretty(info).map_err(|e| StorageError::Other(format!("json serialize: {e}")))?;
    std::fs::write(&path, json).map_err(|e| StorageError::Io(e).with_context(format!("write {}", path.display())))?;
    tracing::debug!(path = %path.display(), "metadata written");
    Ok(())
}
