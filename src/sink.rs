//! Output files for flushed cycles
//!
//! Decoders describe what they flush as groups, scalar attributes and N-d
//! datasets through [`RecordSink`]. One sink is opened per cycle file by a
//! [`SinkFactory`] and closed once every card has written out.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use bincode::Options;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::SinkError;

pub trait RecordSink {
    fn create_group(&mut self, path: &str) -> Result<(), SinkError>;
    fn attr_u32(&mut self, path: &str, name: &str, value: u32) -> Result<(), SinkError>;
    fn attr_f64(&mut self, path: &str, name: &str, value: f64) -> Result<(), SinkError>;
    fn attr_str(&mut self, path: &str, name: &str, value: &str) -> Result<(), SinkError>;
    fn dataset_u16(&mut self, path: &str, shape: &[usize], data: &[u16]) -> Result<(), SinkError>;
    fn dataset_u32(&mut self, path: &str, shape: &[usize], data: &[u32]) -> Result<(), SinkError>;
    /// Flush and release the file. Nothing is durable until this returns.
    fn close(self: Box<Self>) -> Result<(), SinkError>;
}

/// Opens one sink per cycle file
pub trait SinkFactory: Send {
    /// `base` carries no extension; the factory adds its own.
    fn create(&mut self, base: &str) -> Result<Box<dyn RecordSink>, SinkError>;
}

fn check_shape(path: &str, shape: &[usize], len: usize) -> Result<(), SinkError> {
    if shape.iter().product::<usize>() != len {
        return Err(SinkError::Shape {
            path: path.to_owned(),
            shape: shape.to_vec(),
            len,
        });
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    U32(u32),
    F64(f64),
    Str(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dataset {
    U16 { shape: Vec<usize>, data: Vec<u16> },
    U32 { shape: Vec<usize>, data: Vec<u32> },
}

impl Dataset {
    pub fn shape(&self) -> &[usize] {
        match self {
            Dataset::U16 { shape, .. } | Dataset::U32 { shape, .. } => shape,
        }
    }
}

/// Everything written to one file, held in memory
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemorySink {
    name: String,
    groups: BTreeSet<String>,
    attrs: BTreeMap<(String, String), AttrValue>,
    datasets: BTreeMap<String, Dataset>,
    #[serde(skip)]
    closed: Option<Arc<Mutex<Vec<MemorySink>>>>,
}

impl MemorySink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_group(&self, path: &str) -> bool {
        self.groups.contains(path)
    }

    pub fn attr(&self, path: &str, name: &str) -> Option<&AttrValue> {
        self.attrs.get(&(path.to_owned(), name.to_owned()))
    }

    pub fn dataset(&self, path: &str) -> Option<&Dataset> {
        self.datasets.get(path)
    }

    pub fn u16s(&self, path: &str) -> Option<&[u16]> {
        match self.datasets.get(path)? {
            Dataset::U16 { data, .. } => Some(data),
            Dataset::U32 { .. } => None,
        }
    }

    pub fn u32s(&self, path: &str) -> Option<&[u32]> {
        match self.datasets.get(path)? {
            Dataset::U32 { data, .. } => Some(data),
            Dataset::U16 { .. } => None,
        }
    }

    pub fn dataset_paths(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }
}

impl RecordSink for MemorySink {
    fn create_group(&mut self, path: &str) -> Result<(), SinkError> {
        self.groups.insert(path.to_owned());
        Ok(())
    }

    fn attr_u32(&mut self, path: &str, name: &str, value: u32) -> Result<(), SinkError> {
        self.attrs
            .insert((path.to_owned(), name.to_owned()), AttrValue::U32(value));
        Ok(())
    }

    fn attr_f64(&mut self, path: &str, name: &str, value: f64) -> Result<(), SinkError> {
        self.attrs
            .insert((path.to_owned(), name.to_owned()), AttrValue::F64(value));
        Ok(())
    }

    fn attr_str(&mut self, path: &str, name: &str, value: &str) -> Result<(), SinkError> {
        self.attrs.insert(
            (path.to_owned(), name.to_owned()),
            AttrValue::Str(value.to_owned()),
        );
        Ok(())
    }

    fn dataset_u16(&mut self, path: &str, shape: &[usize], data: &[u16]) -> Result<(), SinkError> {
        check_shape(path, shape, data.len())?;
        self.datasets.insert(
            path.to_owned(),
            Dataset::U16 {
                shape: shape.to_vec(),
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    fn dataset_u32(&mut self, path: &str, shape: &[usize], data: &[u32]) -> Result<(), SinkError> {
        check_shape(path, shape, data.len())?;
        self.datasets.insert(
            path.to_owned(),
            Dataset::U32 {
                shape: shape.to_vec(),
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<(), SinkError> {
        if let Some(closed) = self.closed.take() {
            closed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(*self);
        }
        Ok(())
    }
}

/// Collects closed [`MemorySink`]s; clones share the same list.
#[derive(Clone, Debug, Default)]
pub struct MemoryFiles {
    closed: Arc<Mutex<Vec<MemorySink>>>,
}

impl MemoryFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every file closed so far, in close order
    pub fn files(&self) -> Vec<MemorySink> {
        self.closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SinkFactory for MemoryFiles {
    fn create(&mut self, base: &str) -> Result<Box<dyn RecordSink>, SinkError> {
        let mut sink = MemorySink::new(base);
        sink.closed = Some(self.closed.clone());
        Ok(Box::new(sink))
    }
}

/// The default output format: the whole file image, bincode encoded.
///
/// Nothing touches the disk until [`RecordSink::close`], which writes
/// `<path>.tmp` and renames it into place.
pub struct RawSink {
    path: PathBuf,
    image: MemorySink,
}

fn raw_options() -> impl Options {
    bincode::DefaultOptions::new()
}

impl RawSink {
    pub fn create(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let image = MemorySink::new(&path.to_string_lossy());
        Self { path, image }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    fn persist(&self, tmp: &Path) -> Result<(), SinkError> {
        let mut out = BufWriter::new(File::create(tmp)?);
        raw_options().serialize_into(&mut out, &self.image)?;
        out.flush()?;
        out.get_ref().sync_all()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }

    /// Load a raw file back into memory.
    pub fn read(path: impl AsRef<Path>) -> Result<MemorySink, SinkError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        // Length prefixes can't claim more than the file holds
        let mut image: MemorySink = raw_options()
            .with_limit(len)
            .deserialize_from(BufReader::new(file))?;
        image.name = path.to_string_lossy().into_owned();
        Ok(image)
    }
}

impl RecordSink for RawSink {
    fn create_group(&mut self, path: &str) -> Result<(), SinkError> {
        self.image.create_group(path)
    }

    fn attr_u32(&mut self, path: &str, name: &str, value: u32) -> Result<(), SinkError> {
        self.image.attr_u32(path, name, value)
    }

    fn attr_f64(&mut self, path: &str, name: &str, value: f64) -> Result<(), SinkError> {
        self.image.attr_f64(path, name, value)
    }

    fn attr_str(&mut self, path: &str, name: &str, value: &str) -> Result<(), SinkError> {
        self.image.attr_str(path, name, value)
    }

    fn dataset_u16(&mut self, path: &str, shape: &[usize], data: &[u16]) -> Result<(), SinkError> {
        self.image.dataset_u16(path, shape, data)
    }

    fn dataset_u32(&mut self, path: &str, shape: &[usize], data: &[u32]) -> Result<(), SinkError> {
        self.image.dataset_u32(path, shape, data)
    }

    fn close(self: Box<Self>) -> Result<(), SinkError> {
        let tmp = self.tmp_path();
        if let Err(e) = self.persist(&tmp) {
            if tmp.exists() {
                if let Err(rm) = fs::remove_file(&tmp) {
                    warn!(file = %tmp.display(), "Could not remove partial output: {rm}");
                }
            }
            return Err(e);
        }
        info!(file = %self.path.display(), "Closed output");
        Ok(())
    }
}

/// Opens `<base>.raw` files
#[derive(Clone, Debug, Default)]
pub struct RawFiles;

impl SinkFactory for RawFiles {
    fn create(&mut self, base: &str) -> Result<Box<dyn RecordSink>, SinkError> {
        Ok(Box::new(RawSink::create(format!("{base}.raw"))))
    }
}

#[cfg(feature = "hdf5")]
pub use self::h5::{Hdf5Files, Hdf5Sink};

#[cfg(feature = "hdf5")]
mod h5 {
    use std::fs;

    use hdf5::types::VarLenUnicode;
    use tracing::{info, warn};

    use super::{check_shape, RecordSink, SinkFactory};
    use crate::error::SinkError;

    /// Written as `<path>.tmp` and renamed into place on close
    pub struct Hdf5Sink {
        file: hdf5::File,
        path: String,
        tmp: String,
        closed: bool,
    }

    impl Hdf5Sink {
        pub fn create(path: &str) -> Result<Self, SinkError> {
            let tmp = format!("{path}.tmp");
            Ok(Self {
                file: hdf5::File::create(&tmp)?,
                path: path.to_owned(),
                tmp,
                closed: false,
            })
        }
    }

    impl Drop for Hdf5Sink {
        fn drop(&mut self) {
            if !self.closed {
                if let Err(e) = fs::remove_file(&self.tmp) {
                    warn!(file = %self.tmp, "Could not remove partial output: {e}");
                }
            }
        }
    }

    impl RecordSink for Hdf5Sink {
        fn create_group(&mut self, path: &str) -> Result<(), SinkError> {
            self.file.create_group(path)?;
            Ok(())
        }

        fn attr_u32(&mut self, path: &str, name: &str, value: u32) -> Result<(), SinkError> {
            let attr = self
                .file
                .group(path)?
                .new_attr::<u32>()
                .shape(())
                .create(name)?;
            attr.write_scalar(&value)?;
            Ok(())
        }

        fn attr_f64(&mut self, path: &str, name: &str, value: f64) -> Result<(), SinkError> {
            let attr = self
                .file
                .group(path)?
                .new_attr::<f64>()
                .shape(())
                .create(name)?;
            attr.write_scalar(&value)?;
            Ok(())
        }

        fn attr_str(&mut self, path: &str, name: &str, value: &str) -> Result<(), SinkError> {
            let value: VarLenUnicode = value
                .parse()
                .map_err(|e: hdf5::types::StringError| hdf5::Error::from(e.to_string()))?;
            let attr = self
                .file
                .group(path)?
                .new_attr::<VarLenUnicode>()
                .shape(())
                .create(name)?;
            attr.write_scalar(&value)?;
            Ok(())
        }

        fn dataset_u16(
            &mut self,
            path: &str,
            shape: &[usize],
            data: &[u16],
        ) -> Result<(), SinkError> {
            check_shape(path, shape, data.len())?;
            let ds = self.file.new_dataset::<u16>().shape(shape).create(path)?;
            ds.write_raw(data)?;
            Ok(())
        }

        fn dataset_u32(
            &mut self,
            path: &str,
            shape: &[usize],
            data: &[u32],
        ) -> Result<(), SinkError> {
            check_shape(path, shape, data.len())?;
            let ds = self.file.new_dataset::<u32>().shape(shape).create(path)?;
            ds.write_raw(data)?;
            Ok(())
        }

        fn close(mut self: Box<Self>) -> Result<(), SinkError> {
            self.file.flush()?;
            fs::rename(&self.tmp, &self.path)?;
            self.closed = true;
            info!(file = %self.path, "Closed output");
            Ok(())
        }
    }

    /// Opens `<base>.h5` files
    #[derive(Clone, Debug, Default)]
    pub struct Hdf5Files;

    impl SinkFactory for Hdf5Files {
        fn create(&mut self, base: &str) -> Result<Box<dyn RecordSink>, SinkError> {
            Ok(Box::new(Hdf5Sink::create(&format!("{base}.h5"))?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(sink: &mut dyn RecordSink) {
        sink.create_group("/psd0").unwrap();
        sink.attr_u32("/psd0", "bits", 14).unwrap();
        sink.attr_f64("/psd0", "ns_sample", 2.0).unwrap();
        sink.attr_str("/", "run_start", "2024-01-01T00:00:00Z").unwrap();
        sink.dataset_u16("/psd0/samples", &[2, 3], &[1, 2, 3, 4, 5, 6])
            .unwrap();
        sink.dataset_u32("/psd0/times", &[2], &[10, 20]).unwrap();
    }

    #[test]
    fn test_shape_checked() {
        let mut sink = MemorySink::new("x");
        assert!(matches!(
            sink.dataset_u16("/a", &[2, 2], &[1, 2, 3]),
            Err(SinkError::Shape { len: 3, .. })
        ));
    }

    #[test]
    fn test_memory_files_collect_on_close() {
        let mut files = MemoryFiles::new();
        let mut sink = files.create("run.0").unwrap();
        fill(sink.as_mut());
        assert!(files.files().is_empty());
        sink.close().unwrap();
        let got = files.files();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name(), "run.0");
        assert_eq!(got[0].u32s("/psd0/times"), Some(&[10, 20][..]));
    }

    #[test]
    fn test_raw_container_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("run");
        let mut sink = RawFiles.create(&base.to_string_lossy()).unwrap();
        fill(sink.as_mut());
        assert!(!dir.path().join("run.raw").exists());
        sink.close().unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, ["run.raw"]);

        let read = RawSink::read(dir.path().join("run.raw")).unwrap();
        assert!(read.has_group("/psd0"));
        assert_eq!(read.attr("/psd0", "bits"), Some(&AttrValue::U32(14)));
        assert_eq!(read.attr("/psd0", "ns_sample"), Some(&AttrValue::F64(2.0)));
        assert_eq!(
            read.attr("/", "run_start"),
            Some(&AttrValue::Str("2024-01-01T00:00:00Z".into()))
        );
        assert_eq!(read.u16s("/psd0/samples"), Some(&[1, 2, 3, 4, 5, 6][..]));
        assert_eq!(read.dataset("/psd0/samples").unwrap().shape(), &[2, 3]);
        assert_eq!(read.u32s("/psd0/times"), Some(&[10, 20][..]));
    }

    #[test]
    fn test_unclosed_raw_sink_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawFiles
            .create(&dir.path().join("run").to_string_lossy())
            .unwrap();
        fill(sink.as_mut());
        drop(sink);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_raw_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.raw");
        std::fs::write(&path, b"not a container").unwrap();
        assert!(RawSink::read(&path).is_err());
    }
}
