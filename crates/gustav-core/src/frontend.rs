//! Response frontends.
//!
//! A frontend must look synchronous to the runner: every call returns once
//! the operator or listener has answered.

use std::collections::VecDeque;
use std::io::{BufRead, Write};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GustavError, Result};
use crate::range::parse_range;

/// What a frontend hands back for one response request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Token(String),
    /// The listener did not answer (e.g. a frontend-side timeout).
    NoResponse,
    /// Input is closed; treated like a quit key.
    Closed,
}

/// Everything a frontend may use to collect one response.
#[derive(Debug, Clone)]
pub struct ResponseRequest<'a> {
    pub prompt: &'a str,
    pub valid_keys: &'a [String],
    pub quit_keys: &'a [String],
    /// The answer counted as correct, when the method knows it.
    pub expected: Option<&'a str>,
    /// Current dynamic value, when the method is adaptive.
    pub level: Option<f64>,
}

pub trait Frontend {
    fn name(&self) -> &str;

    /// Shows interface text to the operator or listener.
    fn show(&mut self, message: &str) -> Result<()>;

    fn get_response(&mut self, request: &ResponseRequest<'_>) -> Result<Reply>;

    /// Reads one free-form line from the operator; `None` when input is closed.
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>>;

    /// Asks the operator for a 1-based condition number. `None` quits.
    fn choose_condition(&mut self, table: &str, conditions: usize) -> Result<Option<usize>> {
        self.show(table)?;
        loop {
            let prompt = format!("condition (1-{}, q to quit): ", conditions);
            let Some(line) = self.read_line(&prompt)? else {
                return Ok(None);
            };
            let line = line.trim();
            if line.eq_ignore_ascii_case("q") {
                return Ok(None);
            }
            match line.parse::<usize>() {
                Ok(n) if (1..=conditions).contains(&n) => return Ok(Some(n - 1)),
                _ => {
                    let err = GustavError::ResponseInvalid(line.to_string());
                    warn!(error = %err, "condition choice rejected");
                    self.show(&format!("'{}' is not a condition number", line))?;
                }
            }
        }
    }

    /// Asks the operator for the whole block order as a range string. A
    /// random range is shuffled with `rng`.
    fn build_order(
        &mut self,
        table: &str,
        conditions: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<usize>> {
        self.show(table)?;
        loop {
            let prompt = format!("block order (e.g. 1:{}, r for random): ", conditions);
            let Some(line) = self.read_line(&prompt)? else {
                return Ok(Vec::new());
            };
            match parse_range(&line) {
                Ok(spec) if spec.indices.iter().all(|c| *c < conditions) => {
                    return Ok(spec.resolve(rng));
                }
                Ok(_) => self.show(&format!("conditions run from 1 to {}", conditions))?,
                Err(err) => self.show(&err.to_string())?,
            }
        }
    }
}

/// Line-based terminal frontend.
pub struct TermFrontend<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> TermFrontend<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn into_parts(self) -> (R, W) {
        (self.input, self.output)
    }

    fn write_out(&mut self, text: &str, newline: bool) -> Result<()> {
        let res = if newline {
            writeln!(self.output, "{}", text)
        } else {
            write!(self.output, "{}", text)
        };
        res.and_then(|_| self.output.flush())
            .map_err(|err| GustavError::io("<terminal>", err))
    }
}

impl TermFrontend<std::io::StdinLock<'static>, std::io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(std::io::stdin().lock(), std::io::stdout())
    }
}

impl<R: BufRead, W: Write> Frontend for TermFrontend<R, W> {
    fn name(&self) -> &str {
        "term"
    }

    fn show(&mut self, message: &str) -> Result<()> {
        self.write_out(message.trim_end_matches('\n'), true)
    }

    fn get_response(&mut self, request: &ResponseRequest<'_>) -> Result<Reply> {
        let prompt = format!("{} [{}]: ", request.prompt, request.valid_keys.join("/"));
        match self.read_line(&prompt)? {
            Some(line) => Ok(Reply::Token(line)),
            None => Ok(Reply::Closed),
        }
    }

    fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
        self.write_out(prompt, false)?;
        let mut line = String::new();
        let n = self
            .input
            .read_line(&mut line)
            .map_err(|err| GustavError::io("<terminal>", err))?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

/// Replays a fixed queue of answers; shown text is kept in `transcript`.
#[derive(Debug, Default)]
pub struct ScriptedFrontend {
    answers: VecDeque<String>,
    pub transcript: Vec<String>,
}

impl ScriptedFrontend {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            transcript: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.answers.len()
    }
}

impl Frontend for ScriptedFrontend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn show(&mut self, message: &str) -> Result<()> {
        self.transcript.push(message.to_string());
        Ok(())
    }

    fn get_response(&mut self, _request: &ResponseRequest<'_>) -> Result<Reply> {
        Ok(match self.answers.pop_front() {
            Some(answer) if answer.is_empty() => Reply::NoResponse,
            Some(answer) => Reply::Token(answer),
            None => Reply::Closed,
        })
    }

    fn read_line(&mut self, _prompt: &str) -> Result<Option<String>> {
        Ok(self.answers.pop_front())
    }
}

fn default_slope() -> f64 {
    1.0
}

/// Psychometric function parameters for [`SimulatedListener`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedConfig {
    /// Dynamic value at the midpoint of the function.
    #[serde(default)]
    pub threshold: f64,
    /// Spread; negative slopes make higher values harder.
    #[serde(default = "default_slope")]
    pub slope: f64,
    /// Probability of a random answer regardless of level.
    #[serde(default)]
    pub lapse: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            slope: default_slope(),
            lapse: 0.0,
            seed: None,
        }
    }
}

/// Answers like a listener with a logistic psychometric function, with the
/// guess rate set by the number of valid keys.
pub struct SimulatedListener {
    config: SimulatedConfig,
    rng: StdRng,
}

impl SimulatedListener {
    pub fn new(config: SimulatedConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    /// Probability of a correct answer at `level` with `alternatives` choices.
    pub fn p_correct(&self, level: f64, alternatives: usize) -> f64 {
        let guess = if alternatives > 0 {
            1.0 / alternatives as f64
        } else {
            0.0
        };
        let slope = if self.config.slope == 0.0 {
            f64::EPSILON
        } else {
            self.config.slope
        };
        let core = 1.0 / (1.0 + (-(level - self.config.threshold) / slope).exp());
        let p = guess + (1.0 - guess) * core;
        (1.0 - self.config.lapse) * p + self.config.lapse * guess
    }
}

impl Frontend for SimulatedListener {
    fn name(&self) -> &str {
        "simulated"
    }

    fn show(&mut self, _message: &str) -> Result<()> {
        Ok(())
    }

    fn get_response(&mut self, request: &ResponseRequest<'_>) -> Result<Reply> {
        let keys = request.valid_keys;
        let Some(expected) = request.expected.filter(|e| !e.is_empty()) else {
            return Ok(keys
                .choose(&mut self.rng)
                .map(|k| Reply::Token(k.clone()))
                .unwrap_or(Reply::NoResponse));
        };
        let p = self.p_correct(request.level.unwrap_or(self.config.threshold), keys.len());
        if self.rng.gen::<f64>() < p {
            return Ok(Reply::Token(expected.to_string()));
        }
        let wrong: Vec<&String> = keys.iter().filter(|k| k.as_str() != expected).collect();
        Ok(wrong
            .choose(&mut self.rng)
            .map(|k| Reply::Token((*k).clone()))
            .unwrap_or(Reply::NoResponse))
    }

    fn read_line(&mut self, _prompt: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn term_frontend_reads_trimmed_lines_and_reports_close() {
        let valid = keys(&["1", "2"]);
        let quit = keys(&["q"]);
        let mut term = TermFrontend::new(Cursor::new(b" 2 \n".to_vec()), Vec::new());
        let request = ResponseRequest {
            prompt: "interval",
            valid_keys: &valid,
            quit_keys: &quit,
            expected: None,
            level: None,
        };
        assert_eq!(term.get_response(&request).expect("reply"), Reply::Token("2".into()));
        assert_eq!(term.get_response(&request).expect("reply"), Reply::Closed);
        let (_, out) = term.into_parts();
        let shown = String::from_utf8(out).expect("utf8");
        assert!(shown.starts_with("interval [1/2]: "));
    }

    #[test]
    fn choose_condition_reprompts_until_valid() {
        let mut scripted = ScriptedFrontend::new(["9", "x", "2"]);
        let chosen = scripted.choose_condition("table", 3).expect("choice");
        assert_eq!(chosen, Some(1));
        assert_eq!(scripted.transcript.len(), 3);

        let mut scripted = ScriptedFrontend::new(["q"]);
        assert_eq!(scripted.choose_condition("table", 3).expect("choice"), None);
    }

    #[test]
    fn build_order_parses_operator_ranges() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut scripted = ScriptedFrontend::new(["7", "3,1:2"]);
        let order = scripted.build_order("table", 3, &mut rng).expect("order");
        assert_eq!(order, vec![2, 0, 1]);
    }

    #[test]
    fn random_build_order_follows_the_seed() {
        let orders: Vec<Vec<usize>> = (0..2)
            .map(|_| {
                let mut rng = StdRng::seed_from_u64(42);
                let mut scripted = ScriptedFrontend::new(["r,1:8"]);
                scripted.build_order("table", 8, &mut rng).expect("order")
            })
            .collect();
        assert_eq!(orders[0], orders[1]);
        let mut sorted = orders[0].clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn scripted_empty_answer_is_no_response() {
        let valid = keys(&["1"]);
        let mut scripted = ScriptedFrontend::new(["", "1"]);
        let request = ResponseRequest {
            prompt: "",
            valid_keys: &valid,
            quit_keys: &[],
            expected: None,
            level: None,
        };
        assert_eq!(scripted.get_response(&request).unwrap(), Reply::NoResponse);
        assert_eq!(scripted.get_response(&request).unwrap(), Reply::Token("1".into()));
        assert_eq!(scripted.get_response(&request).unwrap(), Reply::Closed);
    }

    #[test]
    fn simulated_listener_follows_its_psychometric_function() {
        let listener = SimulatedListener::new(SimulatedConfig {
            threshold: 10.0,
            slope: 2.0,
            lapse: 0.0,
            seed: Some(4),
        });
        let mid = listener.p_correct(10.0, 2);
        assert!((mid - 0.75).abs() < 1e-12);
        assert!(listener.p_correct(40.0, 2) > 0.99);
        assert!((listener.p_correct(-40.0, 2) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn simulated_listener_answers_within_valid_keys() {
        let valid = keys(&["1", "2", "3"]);
        let mut listener = SimulatedListener::new(SimulatedConfig {
            seed: Some(8),
            ..SimulatedConfig::default()
        });
        let mut hits = 0;
        for _ in 0..200 {
            let request = ResponseRequest {
                prompt: "",
                valid_keys: &valid,
                quit_keys: &[],
                expected: Some("2"),
                level: Some(50.0),
            };
            match listener.get_response(&request).expect("reply") {
                Reply::Token(t) => {
                    assert!(valid.contains(&t));
                    if t == "2" {
                        hits += 1;
                    }
                }
                other => panic!("unexpected reply {:?}", other),
            }
        }
        assert!(hits > 190, "easy level should be answered correctly, got {}", hits);
    }
}
