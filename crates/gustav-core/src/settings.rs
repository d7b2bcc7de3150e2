use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::adaptive::AdaptiveConfig;
use crate::error::{GustavError, Result};
use crate::frontend::{Frontend, ScriptedFrontend, SimulatedConfig, SimulatedListener, TermFrontend};
use crate::hooks::HookPoint;
use crate::method::MethodKind;
use crate::planner::VariableSpec;
use crate::session::{ConstantConfig, Method, Strings};
use crate::stim::StimSetConfig;
use crate::template::TemplateMode;

fn default_frontend() -> String {
    "term".to_string()
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

/// One experiment as written in a YAML settings file.
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsFile {
    pub name: String,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub method: MethodKind,
    #[serde(default = "default_frontend")]
    pub frontend: String,
    #[serde(default)]
    pub valid_keys: Vec<String>,
    #[serde(default)]
    pub quit_keys: Vec<String>,
    #[serde(default)]
    pub data_file: String,
    #[serde(default)]
    pub log_file: String,
    #[serde(default = "default_true")]
    pub record: bool,
    /// 1-based block to resume from.
    #[serde(default = "default_one")]
    pub start_block: usize,
    /// 1-based trial to resume from, applied to the first block run.
    #[serde(default = "default_one")]
    pub start_trial: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub template_mode: TemplateMode,
    #[serde(default)]
    pub disable_functions: BTreeSet<String>,
    #[serde(default)]
    pub strings: Strings,
    #[serde(default)]
    pub variables: VariableSpec,
    #[serde(default)]
    pub stim: Vec<StimSetConfig>,
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    #[serde(default)]
    pub constant: ConstantConfig,
    /// Built-in callbacks to register, by hook point.
    #[serde(default)]
    pub hooks: BTreeMap<HookPoint, Vec<String>>,
    /// Initial scratch values, reachable as `$user[key]`.
    #[serde(default)]
    pub user: BTreeMap<String, Value>,
    #[serde(default)]
    pub simulated: SimulatedConfig,
    /// Answers replayed by the `scripted` frontend.
    #[serde(default)]
    pub responses: Vec<String>,
}

impl SettingsFile {
    /// Loads a settings file; relative stimulus paths are resolved against
    /// the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| GustavError::io(path, err))?;
        let mut settings: Self = serde_yaml::from_str(&raw)
            .map_err(|err| GustavError::config(format!("{}: {}", path.display(), err)))?;
        let base = path.parent().unwrap_or(Path::new("."));
        settings.rebase(base);
        Ok(settings)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|err| GustavError::config(err.to_string()))
    }

    fn rebase(&mut self, base: &Path) {
        let join = |p: &PathBuf| -> PathBuf {
            if p.is_absolute() {
                p.clone()
            } else {
                base.join(p)
            }
        };
        for set in &mut self.stim {
            set.path = set.path.as_ref().map(join);
            if set.path.is_none() {
                set.text = set.text.as_ref().map(join);
            }
        }
    }

    pub fn method(&self) -> Method {
        self.method.build(&self.constant, &self.adaptive)
    }

    /// Host name for `$host`: the settings value, else the environment.
    pub fn host(&self) -> String {
        self.host
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .or_else(|| std::env::var("COMPUTERNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// Maps a frontend name to an implementation.
pub fn resolve_frontend(name: &str, settings: &SettingsFile) -> Result<Box<dyn Frontend>> {
    match name {
        "term" => Ok(Box::new(TermFrontend::stdio())),
        "scripted" => Ok(Box::new(ScriptedFrontend::new(settings.responses.clone()))),
        "simulated" => Ok(Box::new(SimulatedListener::new(settings.simulated.clone()))),
        other => Err(GustavError::config(format!(
            "unknown frontend '{}' (expected term, scripted or simulated)",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::OrderPolicy;
    use chrono::Utc;

    const SAMPLE: &str = r#"
name: tone_in_noise
method: adaptive
frontend: scripted
valid_keys: ["1", "2", "3"]
quit_keys: [q]
data_file: "data/$name_$subj.csv"
seed: 7
strings:
  data_trial: "$subj,$block,$dynamic[value],$response"
variables:
  factorial:
    - name: masker
      levels: [speech, noise]
    - name: snr
      levels: [-6, 0, 6]
  order: random
  ignore: [2]
stim:
  - name: noise
    path: sounds
    order: "r,1:3"
    repeat: true
adaptive:
  steps: [4, 2]
  val_start: 60
  val_floor: 0
hooks:
  pre_trial: [choose_interval]
  present_trial: [announce]
user:
  ear: left
responses: ["1", "2"]
"#;

    #[test]
    fn parses_full_settings_file() {
        let settings = SettingsFile::from_yaml(SAMPLE).expect("parse");
        assert_eq!(settings.name, "tone_in_noise");
        assert_eq!(settings.method, MethodKind::Adaptive);
        assert_eq!(settings.variables.factorial[1].levels, vec!["-6", "0", "6"]);
        assert_eq!(settings.variables.order, OrderPolicy::Random);
        assert_eq!(settings.variables.ignore, vec![2]);
        assert_eq!(settings.hooks[&HookPoint::PreTrial], vec!["choose_interval"]);
        assert_eq!(settings.start_block, 1);
        assert!(settings.record);
        match settings.method() {
            Method::Adaptive(cfg) => {
                assert_eq!(cfg.steps, vec![4.0, 2.0]);
                assert_eq!(cfg.val_start, 60.0);
                assert_eq!(cfg.downs, 2);
            }
            other => panic!("unexpected method {:?}", other),
        }
    }

    #[test]
    fn load_resolves_stimulus_paths_against_settings_dir() {
        let dir = std::env::temp_dir().join(format!(
            "gustav_settings_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("settings.yaml");
        fs::write(&path, SAMPLE).expect("write");
        let settings = SettingsFile::load(&path).expect("load");
        assert_eq!(settings.stim[0].path, Some(dir.join("sounds")));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_settings_are_config_errors() {
        let err = SettingsFile::from_yaml("note: missing name").expect_err("no name");
        assert!(err.is_config());
        let err = SettingsFile::from_yaml("name: x\nvariables:\n  order: \"0:3\"\n")
            .expect_err("bad range");
        assert!(err.is_config());
        let missing = SettingsFile::load(Path::new("/nonexistent/gustav/settings.yaml"))
            .expect_err("missing file");
        assert!(matches!(missing, GustavError::Io { .. }));
    }

    #[test]
    fn frontends_resolve_by_name() {
        let settings = SettingsFile::from_yaml(SAMPLE).expect("parse");
        let frontend = resolve_frontend("scripted", &settings).expect("scripted");
        assert_eq!(frontend.name(), "scripted");
        let frontend = resolve_frontend("simulated", &settings).expect("simulated");
        assert_eq!(frontend.name(), "simulated");
        let err = resolve_frontend("qt", &settings).err().expect("unknown");
        assert!(err.is_config());
    }
}
