use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::adaptive::{AdaptiveTrack, StepFn};
use crate::builtins;
use crate::error::{GustavError, Result};
use crate::frontend::Frontend;
use crate::hooks::{HookChains, HookPoint};
use crate::method;
use crate::planner::{plan, Plan};
use crate::range::OrderPolicy;
use crate::save::{DataSink, SaveFn, SaveLevel};
use crate::session::{Descriptor, Response, RunState, Session, Variables};
use crate::settings::{resolve_frontend, SettingsFile};
use crate::stim::StimCursor;

/// Outcome of one adaptive block.
#[derive(Debug, Clone, Serialize)]
pub struct AdaptiveResult {
    pub good_run: bool,
    pub msg: String,
    pub mean: f64,
    pub sd: f64,
    pub reversals: usize,
    pub values_at_rev: Vec<f64>,
}

impl From<&AdaptiveTrack> for AdaptiveResult {
    fn from(track: &AdaptiveTrack) -> Self {
        Self {
            good_run: track.good_run,
            msg: track.msg.clone(),
            mean: track.mean,
            sd: track.sd,
            reversals: track.n_reversals,
            values_at_rev: track.values_at_rev.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockSummary {
    /// 1-based block number.
    pub block: usize,
    /// 1-based condition number.
    pub condition: usize,
    pub levels: BTreeMap<String, String>,
    pub trials: usize,
    pub adaptive: Option<AdaptiveResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub name: String,
    pub subject: String,
    pub blocks_run: usize,
    pub trials_run: usize,
    pub cancelled: bool,
    pub data_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub blocks: Vec<BlockSummary>,
}

/// Resolved configuration, as printed by `gustav --config`.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentDescription {
    pub name: String,
    pub note: String,
    pub method: String,
    pub frontend: String,
    pub record: bool,
    pub data_file: String,
    pub log_file: String,
    pub valid_keys: Vec<String>,
    pub quit_keys: Vec<String>,
    pub variables: Vec<String>,
    pub conditions: usize,
    pub order: String,
    pub ignored: Vec<usize>,
    pub blocks: usize,
    pub stim_sets: BTreeMap<String, usize>,
    pub hooks: BTreeMap<String, Vec<String>>,
    pub disabled: Vec<String>,
}

/// Collects settings, code-registered hooks and overrides, then
/// [`configure`](ExperimentBuilder::configure)s a runnable [`Experiment`].
pub struct ExperimentBuilder {
    settings: SettingsFile,
    hooks: HookChains,
    savers: BTreeMap<SaveLevel, SaveFn>,
    frontend: Option<Box<dyn Frontend>>,
    frontend_name: Option<String>,
    subject: Option<String>,
    record: Option<bool>,
    step_fn: Option<StepFn>,
}

impl ExperimentBuilder {
    pub fn new(settings: SettingsFile) -> Self {
        Self {
            settings,
            hooks: HookChains::new(),
            savers: BTreeMap::new(),
            frontend: None,
            frontend_name: None,
            subject: None,
            record: None,
            step_fn: None,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Ok(Self::new(SettingsFile::load(path)?))
    }

    /// Appends a callback after the settings file's built-ins.
    pub fn hook<F>(mut self, point: HookPoint, name: &str, func: F) -> Self
    where
        F: FnMut(&mut Session) -> anyhow::Result<()> + 'static,
    {
        self.hooks.register(point, name, func);
        self
    }

    pub fn saver<F>(mut self, level: SaveLevel, func: F) -> Self
    where
        F: FnMut(&Session, Option<&Path>) -> anyhow::Result<()> + 'static,
    {
        self.savers.insert(level, Box::new(func));
        self
    }

    pub fn frontend(mut self, frontend: Box<dyn Frontend>) -> Self {
        self.frontend = Some(frontend);
        self
    }

    pub fn frontend_name(mut self, name: &str) -> Self {
        self.frontend_name = Some(name.to_string());
        self
    }

    pub fn subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn record(mut self, record: bool) -> Self {
        self.record = Some(record);
        self
    }

    /// Replaces the default adaptive step rule.
    pub fn step_fn<F>(mut self, func: F) -> Self
    where
        F: Fn(&mut AdaptiveTrack) + 'static,
    {
        self.step_fn = Some(std::sync::Arc::new(func));
        self
    }

    pub fn configure(self) -> Result<Experiment> {
        let settings = self.settings;
        let method = settings.method();
        method::validate(&method)?;

        let mut hooks = settings_hooks(&settings)?;
        hooks.append(self.hooks);
        method::install(&method, &mut hooks);
        if hooks.is_empty(HookPoint::PromptResponse) {
            hooks.register(
                HookPoint::PromptResponse,
                "collect_response",
                builtins::collect_response,
            );
        }
        let hooks = hooks.resolve(&settings.disable_functions);
        if hooks.is_empty(HookPoint::PreTrial) {
            return Err(GustavError::config("no pre_trial hook is registered"));
        }

        let record = self.record.unwrap_or(settings.record);
        if record && !settings.strings.has_data() && self.savers.is_empty() {
            return Err(GustavError::config(
                "recording is on but no data string or custom saver is configured",
            ));
        }
        if settings.start_block == 0 || settings.start_trial == 0 {
            return Err(GustavError::config("start_block and start_trial are 1-based"));
        }

        let seed = settings.seed.unwrap_or_else(|| rand::thread_rng().gen());
        let mut rng = StdRng::seed_from_u64(seed);
        let plan = plan(&settings.variables, &mut rng)?;
        if plan.policy != OrderPolicy::Menu && settings.start_block > plan.nblocks().max(1) {
            return Err(GustavError::config(format!(
                "start_block {} is past the last block ({})",
                settings.start_block,
                plan.nblocks()
            )));
        }
        let stim = build_cursors(&settings, seed)?;

        let frontend_name = self
            .frontend_name
            .unwrap_or_else(|| settings.frontend.clone());
        let frontend = match self.frontend {
            Some(frontend) => frontend,
            None => resolve_frontend(&frontend_name, &settings)?,
        };

        let descriptor = Descriptor {
            name: settings.name.clone(),
            note: settings.note.clone(),
            comment: settings.comment.clone(),
            subject: self.subject.unwrap_or_else(|| settings.subject.clone()),
            host: settings.host(),
            data_file: settings.data_file.clone(),
            log_file: settings.log_file.clone(),
            valid_keys: settings.valid_keys.clone(),
            quit_keys: settings.quit_keys.clone(),
            method,
            frontend: frontend.name().to_string(),
            record,
            start_block: settings.start_block,
            start_trial: settings.start_trial,
            disabled: settings.disable_functions.clone(),
            seed: Some(seed),
            template_mode: settings.template_mode,
            strings: settings.strings.clone(),
        };
        debug!(
            name = %descriptor.name,
            method = descriptor.method.name(),
            frontend = %descriptor.frontend,
            seed,
            "experiment configured"
        );

        let session = Session {
            descriptor,
            run: RunState::default(),
            var: Variables {
                plan,
                current: BTreeMap::new(),
            },
            stim,
            dynamic: None,
            step_fn: self.step_fn,
            user: settings.user.clone(),
            rng,
            frontend,
        };
        Ok(Experiment {
            session,
            hooks,
            sink: DataSink::new(self.savers),
        })
    }
}

fn settings_hooks(settings: &SettingsFile) -> Result<HookChains> {
    let mut hooks = HookChains::new();
    for (point, names) in &settings.hooks {
        for name in names {
            let func = builtins::lookup(name).ok_or_else(|| {
                GustavError::config(format!(
                    "unknown built-in hook '{}' at {} (known: {})",
                    name,
                    point,
                    builtins::NAMES.join(", ")
                ))
            })?;
            hooks.register_boxed(*point, name, func);
        }
    }
    Ok(hooks)
}

fn build_cursors(settings: &SettingsFile, seed: u64) -> Result<BTreeMap<String, StimCursor>> {
    let mut cursors = BTreeMap::new();
    for (i, set) in settings.stim.iter().enumerate() {
        let cursor = StimCursor::from_config(set, seed.wrapping_add(i as u64 + 1))?;
        if cursors.insert(set.name.clone(), cursor).is_some() {
            return Err(GustavError::config(format!(
                "stimulus set '{}' is defined twice",
                set.name
            )));
        }
    }
    Ok(cursors)
}

/// A configured experiment, ready to run once.
pub struct Experiment {
    session: Session,
    hooks: HookChains,
    sink: DataSink,
}

impl Experiment {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn plan(&self) -> &Plan {
        &self.session.var.plan
    }

    /// Runs the experiment to completion or until the operator quits.
    pub fn run(mut self) -> Result<RunSummary> {
        let result = self.run_loop();
        if let Err(err) = &result {
            let _ = self.sink.log(&format!("error: {}", err));
        }
        result
    }

    fn stage(&mut self, point: HookPoint) -> Result<()> {
        self.hooks.run(point, &mut self.session)?;
        let template = self
            .session
            .descriptor
            .strings
            .log_for(point)
            .unwrap_or_default();
        if !template.is_empty() {
            let line = self.session.render(template)?;
            self.sink.log(&line)?;
        }
        Ok(())
    }

    fn quit_requested(&self) -> bool {
        matches!(self.session.run.response, Some(Response::Quit(_))) || !self.session.run.exp_is_go
    }

    fn run_loop(&mut self) -> Result<RunSummary> {
        let resume = self.session.descriptor.start_trial - 1;
        let first_block = self.session.descriptor.start_block - 1;
        {
            let run = &mut self.session.run;
            run.stamp();
            run.exp_is_go = true;
            run.nblocks = self.session.var.plan.nblocks();
            run.block = first_block;
            run.trials_exp = resume;
        }
        self.sink.open(&self.session)?;
        info!(
            name = %self.session.descriptor.name,
            subject = %self.session.descriptor.subject,
            blocks = self.session.run.nblocks,
            "experiment started"
        );
        self.stage(HookPoint::PreExp)?;

        if self.session.var.plan.policy == OrderPolicy::Menu && self.session.run.exp_is_go {
            let table = self.session.var.plan.table();
            let conditions = self.session.var.plan.conditions();
            let session = &mut self.session;
            let order = session
                .frontend
                .build_order(&table, conditions, &mut session.rng)?;
            self.session.var.plan.set_order(order)?;
            self.session.run.nblocks = self.session.var.plan.nblocks();
            info!(order = ?self.session.var.plan.order, "block order built");
        }

        let mut blocks = Vec::new();
        let mut trials_run = 0;
        let mut pending_resume = Some(resume);
        let mut cancelled = false;

        for block in first_block..self.session.run.nblocks {
            if !self.session.run.exp_is_go {
                break;
            }
            self.session.run.block = block;
            let condition = match self.session.var.plan.policy {
                OrderPolicy::Prompt => {
                    let table = self.session.var.plan.table();
                    let conditions = self.session.var.plan.conditions();
                    match self.session.frontend.choose_condition(&table, conditions)? {
                        Some(c) => c,
                        None => {
                            info!("operator quit at condition prompt");
                            self.session.run.exp_is_go = false;
                            cancelled = true;
                            break;
                        }
                    }
                }
                _ => self.session.var.plan.order[block],
            };
            if self.session.var.plan.is_ignored(condition) {
                warn!(condition = condition + 1, "condition is ignored, skipping block");
                continue;
            }

            let start = pending_resume.take().unwrap_or(0);
            {
                let session = &mut self.session;
                session.run.condition = condition;
                session.run.trials_block = start;
                session.run.block_on = true;
                session.run.response = None;
                session.var.current = session.var.plan.condition_levels(condition);
                session.run.stamp();
            }
            info!(
                block = block + 1,
                condition = condition + 1,
                levels = ?self.session.var.current,
                "block started"
            );
            self.stage(HookPoint::PreBlock)?;

            let mut block_trials = 0;
            while self.session.run.block_on {
                self.session.advance_stimuli()?;
                self.session.run.trial_on = true;
                let mut quit = false;
                while self.session.run.trial_on {
                    self.session.run.stamp();
                    self.session.run.response = None;
                    self.stage(HookPoint::PreTrial)?;
                    self.stage(HookPoint::PresentTrial)?;
                    self.stage(HookPoint::PromptResponse)?;
                    if self.quit_requested() {
                        let run = &mut self.session.run;
                        run.block_on = false;
                        run.trial_on = false;
                        run.exp_is_go = false;
                        quit = true;
                        break;
                    }
                    self.stage(HookPoint::PostTrial)?;
                    self.sink.save(SaveLevel::Trial, &self.session)?;
                }
                if quit {
                    info!(block = block + 1, "operator quit");
                    cancelled = true;
                    break;
                }
                debug!(
                    block = block + 1,
                    trial = self.session.run.trials_exp + 1,
                    response = %self.session.response(),
                    "trial done"
                );
                self.session.run.trials_block += 1;
                self.session.run.trials_exp += 1;
                block_trials += 1;
            }
            trials_run += block_trials;

            self.stage(HookPoint::PostBlock)?;
            self.sink.save(SaveLevel::Block, &self.session)?;
            blocks.push(BlockSummary {
                block: block + 1,
                condition: condition + 1,
                levels: self.session.var.current.clone(),
                trials: block_trials,
                adaptive: self.session.track().map(AdaptiveResult::from),
            });
        }

        self.stage(HookPoint::PostExp)?;
        self.sink.save(SaveLevel::Exp, &self.session)?;
        info!(
            blocks = blocks.len(),
            trials = trials_run,
            cancelled,
            "experiment finished"
        );

        Ok(RunSummary {
            name: self.session.descriptor.name.clone(),
            subject: self.session.descriptor.subject.clone(),
            blocks_run: blocks.len(),
            trials_run,
            cancelled,
            data_file: self.sink.data_path().map(Path::to_path_buf),
            log_file: self.sink.log_path().map(Path::to_path_buf),
            blocks,
        })
    }
}

/// Renders the condition table for `--list`.
pub fn list_conditions(settings: &SettingsFile) -> Result<String> {
    let mut rng = StdRng::seed_from_u64(settings.seed.unwrap_or(0));
    Ok(plan(&settings.variables, &mut rng)?.table())
}

/// Resolves everything `configure` would, without touching a frontend.
pub fn describe(settings: &SettingsFile) -> Result<ExperimentDescription> {
    let method = settings.method();
    method::validate(&method)?;
    let seed = settings.seed.unwrap_or(0);
    let mut rng = StdRng::seed_from_u64(seed);
    let plan = plan(&settings.variables, &mut rng)?;
    let stim_sets = build_cursors(settings, seed)?
        .into_iter()
        .map(|(name, cursor)| (name, cursor.len()))
        .collect();

    let mut hooks = settings_hooks(settings)?;
    method::install(&method, &mut hooks);
    let hooks = hooks.resolve(&settings.disable_functions);
    let hooks = HookPoint::ALL
        .iter()
        .filter(|point| !hooks.is_empty(**point))
        .map(|point| {
            let names = hooks.names(*point).into_iter().map(str::to_string).collect();
            (point.to_string(), names)
        })
        .collect();

    let ignored: BTreeSet<usize> = plan.ignore.iter().map(|c| c + 1).collect();
    Ok(ExperimentDescription {
        name: settings.name.clone(),
        note: settings.note.clone(),
        method: method.name().to_string(),
        frontend: settings.frontend.clone(),
        record: settings.record,
        data_file: settings.data_file.clone(),
        log_file: settings.log_file.clone(),
        valid_keys: settings.valid_keys.clone(),
        quit_keys: settings.quit_keys.clone(),
        variables: plan.names.clone(),
        conditions: plan.conditions(),
        order: plan.policy.to_string(),
        ignored: ignored.into_iter().collect(),
        blocks: plan.nblocks(),
        stim_sets,
        hooks,
        disabled: settings.disable_functions.iter().cloned().collect(),
    })
}
