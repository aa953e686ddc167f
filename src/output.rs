//! CSV persistence of results.
//!
//! Intermediate results are appended one record at a time and flushed, so the file is a valid CSV
//! table after every region. Complete tables are written to a temporary file next to their
//! destination and renamed into place.

use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::error::HhiError;
use crate::models::{HhiRecord, ShareRow};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

/// Column names of the HHI output files.
pub const HHI_HEADERS: [&str; 2] = ["home_cbsa_id", "hhi"];

/// Column names of the share table output file.
pub const SHARE_HEADERS: [&str; 4] = ["home_cbsa_id", "end_geohash", "trip_count", "share"];

/// Appends serialisable records to a CSV file, flushing after every record.
pub struct CsvAppender<T> {
    /// Destination path
    path: PathBuf,
    /// CSV writer over the open file
    writer: csv::Writer<File>,
    /// Number of records appended through this appender
    appended: usize,
    record: PhantomData<T>,
}

impl<T: Serialize> CsvAppender<T> {
    /// Create or truncate `path` and write the header row.
    ///
    /// # Arguments
    ///
    /// * `path`: Destination path
    /// * `headers`: Column names, matching the fields of `T`
    pub fn create(path: &Path, headers: &[&str]) -> Result<Self, HhiError> {
        let file = File::create(path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record(headers)?;
        writer.flush()?;
        Ok(CsvAppender {
            path: path.to_path_buf(),
            writer,
            appended: 0,
            record: PhantomData,
        })
    }

    /// Open an existing file written by [CsvAppender::create] for further appends.
    pub fn append_to(path: &Path) -> Result<Self, HhiError> {
        let file = OpenOptions::new().append(true).open(path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        Ok(CsvAppender {
            path: path.to_path_buf(),
            writer,
            appended: 0,
            record: PhantomData,
        })
    }

    /// Append a record and flush it to the file.
    pub fn append(&mut self, record: &T) -> Result<(), HhiError> {
        self.writer.serialize(record)?;
        self.writer.flush()?;
        self.appended += 1;
        Ok(())
    }

    /// Append several records, flushing once at the end.
    pub fn append_all<'a, I>(&mut self, records: I) -> Result<(), HhiError>
    where
        I: IntoIterator<Item = &'a T>,
        T: 'a,
    {
        for record in records {
            self.writer.serialize(record)?;
            self.appended += 1;
        }
        self.writer.flush()?;
        Ok(())
    }

    /// Number of records appended so far.
    pub fn appended(&self) -> usize {
        self.appended
    }

    /// Destination path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Appender for the intermediate HHI file.
pub type HhiAppender = CsvAppender<HhiRecord>;

/// Appender for the share table file.
pub type ShareAppender = CsvAppender<ShareRow>;

/// Write a complete table to `path`, replacing any existing file atomically.
///
/// # Arguments
///
/// * `path`: Destination path
/// * `headers`: Column names, matching the fields of `T`
/// * `records`: Rows of the table
pub fn write_table<T: Serialize>(
    path: &Path,
    headers: &[&str],
    records: &[T],
) -> Result<(), HhiError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file = NamedTempFile::new_in(dir)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.write_record(headers)?;
    for record in records {
        writer.serialize(record)?;
    }
    let file = writer.into_inner().map_err(|err| err.into_error())?;
    file.as_file().sync_all()?;
    file.persist(path)?;
    Ok(())
}

/// Read an HHI table written by [CsvAppender] or [write_table].
pub fn read_records(path: &Path) -> Result<Vec<HhiRecord>, HhiError> {
    let mut reader = csv::Reader::from_path(path)?;
    let records = reader
        .deserialize()
        .collect::<Result<Vec<HhiRecord>, csv::Error>>()?;
    Ok(records)
}

/// Read a table written by [CsvAppender] whose last append may have been interrupted.
///
/// Every complete record ends in a newline, so bytes after the last newline are a torn record
/// and are dropped with a warning. Malformed complete records are still errors.
pub fn read_appended<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, HhiError> {
    let mut contents = std::fs::read(path)?;
    if !contents.is_empty() && !contents.ends_with(b"\n") {
        let complete = contents
            .iter()
            .rposition(|byte| *byte == b'\n')
            .map_or(0, |newline| newline + 1);
        tracing::warn!(
            "Dropping incomplete last line {:?} of {}",
            String::from_utf8_lossy(&contents[complete..]),
            path.display()
        );
        contents.truncate(complete);
    }
    let mut reader = csv::Reader::from_reader(contents.as_slice());
    let records = reader
        .deserialize()
        .collect::<Result<Vec<T>, csv::Error>>()?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::RegionId;

    fn record(region: &str, hhi: f64) -> HhiRecord {
        HhiRecord::new(RegionId::from(region), hhi)
    }

    #[test]
    fn create_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intermediate.csv");
        let appender = HhiAppender::create(&path, &HHI_HEADERS).unwrap();
        assert_eq!(0, appender.appended());
        assert_eq!("home_cbsa_id,hhi\n", std::fs::read_to_string(&path).unwrap());
        assert!(read_records(&path).unwrap().is_empty());
    }

    #[test]
    fn append_is_visible_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intermediate.csv");
        let mut appender = HhiAppender::create(&path, &HHI_HEADERS).unwrap();
        appender.append(&record("A", 0.625)).unwrap();
        assert_eq!(vec![record("A", 0.625)], read_records(&path).unwrap());
        appender.append(&record("B", 1.0)).unwrap();
        assert_eq!(
            "home_cbsa_id,hhi\nA,0.625\nB,1.0\n",
            std::fs::read_to_string(&path).unwrap()
        );
        assert_eq!(2, appender.appended());
        assert_eq!(path, appender.path());
    }

    #[test]
    fn create_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intermediate.csv");
        std::fs::write(&path, "home_cbsa_id,hhi\nstale,0.5\n").unwrap();
        let mut appender = HhiAppender::create(&path, &HHI_HEADERS).unwrap();
        appender.append_all(&[record("A", 0.625)]).unwrap();
        assert_eq!(vec![record("A", 0.625)], read_records(&path).unwrap());
    }

    #[test]
    fn append_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intermediate.csv");
        HhiAppender::create(&path, &HHI_HEADERS)
            .unwrap()
            .append(&record("A", 0.625))
            .unwrap();
        let mut appender = HhiAppender::append_to(&path).unwrap();
        appender.append(&record("B", 1.0)).unwrap();
        assert_eq!(1, appender.appended());
        assert_eq!(
            vec![record("A", 0.625), record("B", 1.0)],
            read_records(&path).unwrap()
        );
    }

    #[test]
    fn share_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shares.csv");
        let mut appender = ShareAppender::create(&path, &SHARE_HEADERS).unwrap();
        appender
            .append(&ShareRow {
                home_cbsa_id: RegionId::from("A"),
                end_geohash: Some("aaaaa".to_string()),
                trip_count: 3,
                share: 0.75,
            })
            .unwrap();
        appender
            .append(&ShareRow {
                home_cbsa_id: RegionId::from("A"),
                end_geohash: None,
                trip_count: 1,
                share: 0.25,
            })
            .unwrap();
        assert_eq!(
            "home_cbsa_id,end_geohash,trip_count,share\nA,aaaaa,3,0.75\nA,,1,0.25\n",
            std::fs::read_to_string(&path).unwrap()
        );
        let rows: Vec<ShareRow> = read_appended(&path).unwrap();
        assert_eq!(None, rows[1].end_geohash);
    }

    #[test]
    fn final_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("final.csv");
        std::fs::write(&path, "garbage").unwrap();
        let records = vec![record("A", 0.625), record("B", 1.0)];
        write_table(&path, &HHI_HEADERS, &records).unwrap();
        assert_eq!(records, read_records(&path).unwrap());
        // Only the final file is left behind.
        assert_eq!(1, std::fs::read_dir(dir.path()).unwrap().count());
    }

    #[test]
    fn final_empty_table_has_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("final.csv");
        write_table::<HhiRecord>(&path, &HHI_HEADERS, &[]).unwrap();
        assert_eq!("home_cbsa_id,hhi\n", std::fs::read_to_string(&path).unwrap());
    }

    #[test]
    fn appended_drops_torn_last_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intermediate.csv");
        std::fs::write(&path, "home_cbsa_id,hhi\nA,0.625\nB,0.3").unwrap();
        let records: Vec<HhiRecord> = read_appended(&path).unwrap();
        assert_eq!(vec![record("A", 0.625)], records);
    }

    #[test]
    fn appended_torn_header_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intermediate.csv");
        std::fs::write(&path, "home_cbsa").unwrap();
        let records: Vec<HhiRecord> = read_appended(&path).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn appended_rejects_malformed_inner_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intermediate.csv");
        std::fs::write(&path, "home_cbsa_id,hhi\nA\nB,1.0\n").unwrap();
        assert!(matches!(
            read_appended::<HhiRecord>(&path),
            Err(HhiError::Csv(_))
        ));
    }

    #[test]
    fn read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_records(&dir.path().join("missing.csv")),
            Err(HhiError::Csv(_))
        ));
    }
}
