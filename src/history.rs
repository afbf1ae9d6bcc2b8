//! Record of past issuances.
//!
//! One line per issued certificate, newest last:
//!
//! ```text
//! # ACME certificate history
//! 20260301120000 ab12 https://acme.example/directory https://acme.example/acct/1 20260530120000
//! ```
//!
//! Fields are the renewal time, the serial in lower-case hex, the directory and account URLs and
//! optionally the certificate's expiry, all times in UTC. Lines starting with `#` are kept as they
//! are, and so are data lines that cannot be parsed. Only the most recent [`MAX_ENTRIES`] data
//! lines are retained.

use std::{
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
    time::SystemTime,
};

use eyre::WrapErr as _;
use time::{macros::format_description, OffsetDateTime, PrimitiveDateTime};

pub const MAX_ENTRIES: usize = 10;

const DEFAULT_HEADER: [&str; 2] = [
    "# ACME certificate history, managed automatically",
    "# renewed serial directory-url account-url expires",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub renewed_at: SystemTime,
    pub serial: String,
    pub directory_url: String,
    pub account_url: String,
    pub expires_at: Option<SystemTime>,
}

fn format_timestamp(time: SystemTime) -> eyre::Result<String> {
    let format = format_description!("[year][month][day][hour][minute][second]");
    Ok(OffsetDateTime::from(time).format(format)?)
}

fn parse_timestamp(s: &str) -> eyre::Result<SystemTime> {
    let format = format_description!("[year][month][day][hour][minute][second]");
    Ok(PrimitiveDateTime::parse(s, format)?.assume_utc().into())
}

impl HistoryEntry {
    fn parse(line: &str) -> eyre::Result<Self> {
        let fields = line.split_whitespace().collect::<Vec<_>>();

        let (renewed_at, serial, directory_url, account_url, expires_at) = match fields[..] {
            [renewed_at, serial, directory_url, account_url] => {
                (renewed_at, serial, directory_url, account_url, None)
            }
            [renewed_at, serial, directory_url, account_url, expires_at] => {
                (renewed_at, serial, directory_url, account_url, Some(expires_at))
            }
            _ => eyre::bail!("expected 4 or 5 fields, found {}", fields.len()),
        };

        Ok(HistoryEntry {
            renewed_at: parse_timestamp(renewed_at)?,
            serial: serial.to_ascii_lowercase(),
            directory_url: directory_url.to_owned(),
            account_url: account_url.to_owned(),
            expires_at: expires_at.map(parse_timestamp).transpose()?,
        })
    }

    fn to_line(&self) -> eyre::Result<String> {
        let mut line = format!(
            "{} {} {} {}",
            format_timestamp(self.renewed_at)?,
            self.serial,
            self.directory_url,
            self.account_url,
        );

        if let Some(expires_at) = self.expires_at {
            line.push(' ');
            line.push_str(&format_timestamp(expires_at)?);
        }

        Ok(line)
    }
}

/// A data line of the history file.
#[derive(Debug)]
enum Record {
    Entry(HistoryEntry),
    /// Kept verbatim so a rewrite never loses what it could not read.
    Unparsed(String),
}

/// The history file. Only written by the lifecycle manager while it holds the renewal lock.
#[derive(Debug, Clone)]
pub struct CertificateHistoryLog {
    path: PathBuf,
}

impl CertificateHistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CertificateHistoryLog { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header lines and data lines, in file order. A missing file is empty.
    fn read(&self) -> eyre::Result<(Vec<String>, Vec<Record>)> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Default::default()),
            Err(err) => {
                return Err(err)
                    .wrap_err_with(|| format!("reading history file {}", self.path.display()))
            }
        };

        let mut header = Vec::new();
        let mut records = Vec::new();

        for (n, line) in contents.lines().enumerate() {
            if line.starts_with('#') {
                header.push(line.to_owned());
                continue;
            }

            if line.trim().is_empty() {
                continue;
            }

            match HistoryEntry::parse(line) {
                Ok(entry) => records.push(Record::Entry(entry)),
                Err(err) => {
                    log::warn!(
                        "Skipping malformed line {} of {}: {err}",
                        n + 1,
                        self.path.display()
                    );
                    records.push(Record::Unparsed(line.to_owned()));
                }
            }
        }

        Ok((header, records))
    }

    /// All recorded issuances, oldest first.
    pub fn entries(&self) -> eyre::Result<Vec<HistoryEntry>> {
        Ok(self
            .read()?
            .1
            .into_iter()
            .filter_map(|record| match record {
                Record::Entry(entry) => Some(entry),
                Record::Unparsed(_) => None,
            })
            .collect())
    }

    pub fn last_entry(&self) -> eyre::Result<Option<HistoryEntry>> {
        Ok(self.entries()?.pop())
    }

    /// Directory URL of the most recent issuance.
    pub fn last_directory(&self) -> eyre::Result<Option<String>> {
        Ok(self.last_entry()?.map(|entry| entry.directory_url))
    }

    /// Directory URL that issued the certificate with `serial`.
    pub fn directory_for_serial(&self, serial: &str) -> eyre::Result<Option<String>> {
        Ok(self
            .entries()?
            .into_iter()
            .rev()
            .find(|entry| entry.serial.eq_ignore_ascii_case(serial))
            .map(|entry| entry.directory_url))
    }

    /// Appends `entry`, dropping the oldest entries beyond [`MAX_ENTRIES`].
    ///
    /// The file is replaced atomically; a reader sees either the old or the new history.
    pub fn append(&self, entry: HistoryEntry) -> eyre::Result<()> {
        let (mut header, mut records) = self.read()?;

        if header.is_empty() {
            header = DEFAULT_HEADER.iter().map(|&line| line.to_owned()).collect();
        }

        records.push(Record::Entry(entry));
        if records.len() > MAX_ENTRIES {
            records.drain(..records.len() - MAX_ENTRIES);
        }

        let mut contents = header.join("\n");
        contents.push('\n');
        for record in &records {
            match record {
                Record::Entry(entry) => contents.push_str(&entry.to_line()?),
                Record::Unparsed(line) => contents.push_str(line),
            }
            contents.push('\n');
        }

        self.write_atomic(contents.as_bytes())
            .wrap_err_with(|| format!("writing history file {}", self.path.display()))
    }

    fn write_atomic(&self, contents: &[u8]) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(contents)?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|err| err.error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    fn entry(n: u64) -> HistoryEntry {
        HistoryEntry {
            renewed_at: UNIX_EPOCH + Duration::from_secs(1_700_000_000 + n * 60),
            serial: format!("{:x}", 0xab00 + n),
            directory_url: "https://acme.example/directory".to_owned(),
            account_url: "https://acme.example/acct/1".to_owned(),
            expires_at: Some(UNIX_EPOCH + Duration::from_secs(1_710_000_000 + n * 60)),
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = CertificateHistoryLog::new(dir.path().join("history.txt"));

        assert!(log.entries().unwrap().is_empty());
        assert_eq!(log.last_directory().unwrap(), None);
    }

    #[test]
    fn keeps_ten_most_recent_entries_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.txt");
        fs::write(&path, "# my notes\n").unwrap();

        let log = CertificateHistoryLog::new(&path);
        for n in 0..12 {
            log.append(entry(n)).unwrap();
        }

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), MAX_ENTRIES);
        assert_eq!(entries[0], entry(2));
        assert_eq!(entries[9], entry(11));

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("# my notes\n"));
        assert_eq!(contents.lines().count(), 11);
    }

    #[test]
    fn line_format_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.txt");
        let log = CertificateHistoryLog::new(&path);

        log.append(entry(0)).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let line = contents.lines().last().unwrap();
        assert_eq!(
            line,
            "20231114221320 ab00 https://acme.example/directory https://acme.example/acct/1 20240309160000"
        );
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.txt");
        fs::write(
            &path,
            "# header\n\
             garbage\n\
             20231114221320 ab00 https://a.example/dir https://a.example/acct/1 20240309160000\n\
             2023 ab01 https://b.example/dir https://b.example/acct/1 20240309160000\n",
        )
        .unwrap();

        let log = CertificateHistoryLog::new(&path);
        let entries = log.entries().unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].serial, "ab00");
    }

    #[test]
    fn lookups() {
        let dir = tempfile::tempdir().unwrap();
        let log = CertificateHistoryLog::new(dir.path().join("nested/history.txt"));

        let mut old = entry(0);
        old.directory_url = "https://old.example/directory".to_owned();
        log.append(old).unwrap();
        log.append(entry(1)).unwrap();

        assert_eq!(
            log.last_directory().unwrap().as_deref(),
            Some("https://acme.example/directory")
        );
        assert_eq!(
            log.directory_for_serial("AB00").unwrap().as_deref(),
            Some("https://old.example/directory")
        );
        assert_eq!(log.directory_for_serial("ffff").unwrap(), None);
    }

    #[test]
    fn expiry_field_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.txt");
        fs::write(
            &path,
            "# header\n20231114221320 ab00 https://old.example/dir https://old.example/acct/1\n",
        )
        .unwrap();

        let log = CertificateHistoryLog::new(&path);
        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].expires_at, None);
        assert_eq!(
            log.last_directory().unwrap().as_deref(),
            Some("https://old.example/dir")
        );

        log.append(entry(1)).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(
            lines,
            [
                "# header",
                "20231114221320 ab00 https://old.example/dir https://old.example/acct/1",
                "20231114221420 ab01 https://acme.example/directory https://acme.example/acct/1 20240309160100",
            ]
        );
    }

    #[test]
    fn unparsed_lines_survive_a_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.txt");
        fs::write(&path, "# header\nnot a history line\n").unwrap();

        let log = CertificateHistoryLog::new(&path);
        log.append(entry(0)).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\nnot a history line\n"), "{contents}");
        assert_eq!(log.entries().unwrap(), [entry(0)]);
    }
}
