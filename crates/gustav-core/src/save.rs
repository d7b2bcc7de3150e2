use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{GustavError, Result};
use crate::hooks::HookPoint;
use crate::session::Session;

/// Where in the lifecycle a data line is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveLevel {
    Trial,
    Block,
    Exp,
}

impl SaveLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveLevel::Trial => "save_data_trial",
            SaveLevel::Block => "save_data_block",
            SaveLevel::Exp => "save_data_exp",
        }
    }

    fn point(&self) -> HookPoint {
        match self {
            SaveLevel::Trial => HookPoint::PostTrial,
            SaveLevel::Block => HookPoint::PostBlock,
            SaveLevel::Exp => HookPoint::PostExp,
        }
    }
}

/// Custom saver. It receives the resolved data path, if any, and owns
/// whatever it writes there.
pub type SaveFn = Box<dyn FnMut(&Session, Option<&Path>) -> anyhow::Result<()>>;

/// Appends one line, creating parent directories and the file as needed.
/// The file is closed again before returning.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| GustavError::io(parent, err))?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| GustavError::io(path, err))?;
    writeln!(file, "{}", line.trim_end_matches('\n')).map_err(|err| GustavError::io(path, err))
}

/// Data and log emission for one run.
#[derive(Default)]
pub struct DataSink {
    data_path: Option<PathBuf>,
    log_path: Option<PathBuf>,
    savers: BTreeMap<SaveLevel, SaveFn>,
}

impl DataSink {
    pub fn new(savers: BTreeMap<SaveLevel, SaveFn>) -> Self {
        Self {
            data_path: None,
            log_path: None,
            savers,
        }
    }

    pub fn data_path(&self) -> Option<&Path> {
        self.data_path.as_deref()
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Resolves the file templates and writes headers to files that do
    /// not exist yet. With recording off only the log file is opened.
    pub fn open(&mut self, session: &Session) -> Result<()> {
        let d = &session.descriptor;
        if !d.log_file.is_empty() {
            let path = PathBuf::from(session.render(&d.log_file)?);
            if !path.exists() {
                let header = format!(
                    "# {} subject={} host={} started {} {}",
                    d.name, d.subject, d.host, session.run.date, session.run.time
                );
                append_line(&path, &header)?;
            }
            self.log_path = Some(path);
        }
        if !d.record {
            debug!("recording disabled, data file skipped");
        } else if !d.data_file.is_empty() {
            let path = PathBuf::from(session.render(&d.data_file)?);
            if !path.exists() && !d.strings.data_header.is_empty() {
                append_line(&path, &session.render(&d.strings.data_header)?)?;
            }
            self.data_path = Some(path);
        }
        info!(
            data = ?self.data_path,
            log = ?self.log_path,
            "output files resolved"
        );
        Ok(())
    }

    /// Emits one rendered log string to tracing and the log file.
    pub fn log(&self, line: &str) -> Result<()> {
        info!(target: "gustav::log", "{}", line);
        match &self.log_path {
            Some(path) => append_line(path, line),
            None => Ok(()),
        }
    }

    /// Writes the data line for `level`, or hands over to a custom saver.
    pub fn save(&mut self, level: SaveLevel, session: &Session) -> Result<()> {
        if !session.descriptor.record {
            return Ok(());
        }
        if let Some(saver) = self.savers.get_mut(&level) {
            return saver(session, self.data_path.as_deref()).map_err(|err| {
                match err.downcast::<GustavError>() {
                    Ok(core) => core,
                    Err(source) => GustavError::Hook {
                        name: level.as_str().to_string(),
                        point: level.point(),
                        source,
                    },
                }
            });
        }
        let strings = &session.descriptor.strings;
        let template = match level {
            SaveLevel::Trial => &strings.data_trial,
            SaveLevel::Block => &strings.data_block,
            SaveLevel::Exp => &strings.data_exp,
        };
        match &self.data_path {
            Some(path) if !template.is_empty() => append_line(path, &session.render(template)?),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ScriptedFrontend;
    use crate::session::tests::test_session;
    use chrono::Utc;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "gustav_save_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    fn recording_session(dir: &Path) -> Session {
        let mut s = test_session(Box::new(ScriptedFrontend::new(Vec::<String>::new())));
        s.descriptor.record = true;
        s.descriptor.data_file = format!("{}/data/$name_$subj.csv", dir.display());
        s.descriptor.log_file = format!("{}/logs/$name.log", dir.display());
        s.descriptor.strings.data_header = "subject,block,@user[ear]".to_string();
        s.descriptor.strings.data_trial = "$subj,$block,$response".to_string();
        s
    }

    #[test]
    fn header_written_once_and_lines_appended() {
        let dir = scratch_dir("append");
        let s = recording_session(&dir);
        let mut sink = DataSink::default();
        sink.open(&s).expect("open");
        sink.save(SaveLevel::Trial, &s).expect("save");

        let mut again = DataSink::default();
        again.open(&s).expect("reopen");
        again.save(SaveLevel::Trial, &s).expect("save");
        again.save(SaveLevel::Block, &s).expect("empty block template");

        let path = dir.join("data/tone_s01.csv");
        assert_eq!(sink.data_path(), Some(path.as_path()));
        let text = fs::read_to_string(&path).expect("read data");
        assert_eq!(text, "subject,block,ear\ns01,1,\ns01,1,\n");
        let log = fs::read_to_string(dir.join("logs/tone.log")).expect("read log");
        assert_eq!(log.lines().count(), 1);
        assert!(log.starts_with("# tone subject=s01"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn only_the_log_is_written_without_recording() {
        let dir = scratch_dir("off");
        let mut s = recording_session(&dir);
        s.descriptor.record = false;
        let mut sink = DataSink::default();
        sink.open(&s).expect("open");
        sink.save(SaveLevel::Trial, &s).expect("save");
        sink.log("hello").expect("log");
        assert!(sink.data_path().is_none());
        assert!(!dir.join("data").exists());
        let log = fs::read_to_string(dir.join("logs/tone.log")).expect("read log");
        let lines: Vec<&str> = log.lines().collect();
        assert!(lines[0].starts_with("# tone subject=s01"));
        assert_eq!(lines[1], "hello");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn custom_saver_takes_over_its_level() {
        let dir = scratch_dir("custom");
        let s = recording_session(&dir);
        let seen: Rc<RefCell<Vec<String>>> = Rc::default();
        let sink_seen = Rc::clone(&seen);
        let mut savers: BTreeMap<SaveLevel, SaveFn> = BTreeMap::new();
        savers.insert(
            SaveLevel::Trial,
            Box::new(move |session: &Session, path: Option<&Path>| {
                sink_seen.borrow_mut().push(format!(
                    "{} {}",
                    session.descriptor.subject,
                    path.map(|p| p.display().to_string()).unwrap_or_default()
                ));
                Ok(())
            }),
        );
        let mut sink = DataSink::new(savers);
        sink.open(&s).expect("open");
        sink.save(SaveLevel::Trial, &s).expect("save");
        assert_eq!(seen.borrow().len(), 1);
        assert!(seen.borrow()[0].starts_with("s01 "));
        let text = fs::read_to_string(dir.join("data/tone_s01.csv")).expect("read data");
        assert_eq!(text.lines().count(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn failing_saver_is_reported_by_level() {
        let mut s = test_session(Box::new(ScriptedFrontend::new(Vec::<String>::new())));
        s.descriptor.record = true;
        let mut savers: BTreeMap<SaveLevel, SaveFn> = BTreeMap::new();
        savers.insert(
            SaveLevel::Exp,
            Box::new(|_s: &Session, _p: Option<&Path>| Err(anyhow::anyhow!("disk full"))),
        );
        let mut sink = DataSink::new(savers);
        let err = sink.save(SaveLevel::Exp, &s).expect_err("fails");
        match err {
            GustavError::Hook { name, point, .. } => {
                assert_eq!(name, "save_data_exp");
                assert_eq!(point, HookPoint::PostExp);
            }
            other => panic!("unexpected error {}", other),
        }
    }
}
