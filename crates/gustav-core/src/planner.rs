//! Condition planning from factorial and list variables.

use std::collections::{BTreeMap, BTreeSet};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{GustavError, Result};
use crate::range::{unparse_range, OrderPolicy};

/// One independent variable and its levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(deserialize_with = "scalar_strings")]
    pub levels: Vec<String>,
}

impl Variable {
    pub fn new(name: impl Into<String>, levels: &[&str]) -> Self {
        Self {
            name: name.into(),
            levels: levels.iter().map(|l| l.to_string()).collect(),
        }
    }
}

/// Accepts YAML scalars of any kind (`40`, `on`, `"A1"`) as level strings.
fn scalar_strings<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<serde_yaml::Value> = Vec::deserialize(deserializer)?;
    raw.into_iter()
        .map(|value| match value {
            serde_yaml::Value::String(s) => Ok(s),
            serde_yaml::Value::Number(n) => Ok(n.to_string()),
            serde_yaml::Value::Bool(b) => Ok(b.to_string()),
            other => Err(serde::de::Error::custom(format!(
                "variable levels must be scalars, got {:?}",
                other
            ))),
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    #[serde(default)]
    pub factorial: Vec<Variable>,
    #[serde(default)]
    pub list: Vec<Variable>,
    #[serde(default)]
    pub order: OrderPolicy,
    /// 1-based condition numbers to skip.
    #[serde(default)]
    pub ignore: Vec<usize>,
}

/// Result of planning: every condition's levels plus the block order.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// Variable names, factorial first, then list-only names.
    pub names: Vec<String>,
    pub levels_by_cond: BTreeMap<String, Vec<String>>,
    pub factorial_n: usize,
    pub list_n: usize,
    /// Condition ids in run order. Empty for `menu` until the operator
    /// builds an order; identity (unused) for `prompt`.
    pub order: Vec<usize>,
    pub policy: OrderPolicy,
    /// 0-based ignored condition ids.
    pub ignore: BTreeSet<usize>,
}

impl Plan {
    /// Total number of distinct conditions.
    pub fn conditions(&self) -> usize {
        self.factorial_n + self.list_n
    }

    /// Number of blocks the runner iterates over.
    pub fn nblocks(&self) -> usize {
        match self.policy {
            OrderPolicy::Prompt => self.conditions(),
            _ => self.order.len(),
        }
    }

    pub fn is_ignored(&self, condition: usize) -> bool {
        self.ignore.contains(&condition)
    }

    /// Variable name -> level for one condition.
    pub fn condition_levels(&self, condition: usize) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for name in &self.names {
            if let Some(level) = self
                .levels_by_cond
                .get(name)
                .and_then(|levels| levels.get(condition))
            {
                out.insert(name.clone(), level.clone());
            }
        }
        out
    }

    /// Replaces the order with an operator-built list of condition ids.
    pub fn set_order(&mut self, order: Vec<usize>) -> Result<()> {
        let total = self.conditions();
        if let Some(bad) = order.iter().find(|c| **c >= total) {
            return Err(GustavError::config(format!(
                "condition {} is out of range (1..={})",
                bad + 1,
                total
            )));
        }
        self.order = order
            .into_iter()
            .filter(|c| !self.ignore.contains(c))
            .collect();
        Ok(())
    }

    /// Fixed-width condition table, one row per condition.
    pub fn table(&self) -> String {
        let total = self.conditions();
        let mut header = vec!["#".to_string()];
        header.extend(self.names.iter().cloned());
        let mut rows: Vec<Vec<String>> = Vec::with_capacity(total);
        for c in 0..total {
            let mark = if self.is_ignored(c) { "*" } else { "" };
            let mut row = vec![format!("{}{}", c + 1, mark)];
            for name in &self.names {
                row.push(
                    self.levels_by_cond
                        .get(name)
                        .and_then(|levels| levels.get(c))
                        .cloned()
                        .unwrap_or_default(),
                );
            }
            rows.push(row);
        }
        let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
        for row in &rows {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.len());
            }
        }
        let render = |cells: &[String]| -> String {
            cells
                .iter()
                .enumerate()
                .map(|(i, cell)| format!("{:<width$}", cell, width = widths[i]))
                .collect::<Vec<_>>()
                .join("  ")
                .trim_end()
                .to_string()
        };
        let mut out = String::new();
        out.push_str(&render(&header));
        out.push('\n');
        for row in &rows {
            out.push_str(&render(row));
            out.push('\n');
        }
        if !self.ignore.is_empty() {
            let ignored: Vec<usize> = self.ignore.iter().copied().collect();
            out.push_str(&format!("ignored (*): {}\n", unparse_range(&ignored)));
        }
        match self.policy {
            OrderPolicy::Prompt => out.push_str("order: prompt\n"),
            OrderPolicy::Menu if self.order.is_empty() => out.push_str("order: menu\n"),
            _ => {
                let order: Vec<String> = self.order.iter().map(|c| (c + 1).to_string()).collect();
                out.push_str(&format!("order: {}\n", order.join(",")));
            }
        }
        out
    }
}

fn check_variables(kind: &str, vars: &[Variable]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for var in vars {
        if var.name.trim().is_empty() {
            return Err(GustavError::config(format!("{} variable without a name", kind)));
        }
        if !seen.insert(var.name.as_str()) {
            return Err(GustavError::config(format!(
                "{} variable '{}' is declared twice",
                kind, var.name
            )));
        }
        if var.levels.is_empty() {
            return Err(GustavError::config(format!(
                "{} variable '{}' has no levels",
                kind, var.name
            )));
        }
    }
    Ok(())
}

/// Computes every condition and the block order.
pub fn plan<R: Rng + ?Sized>(spec: &VariableSpec, rng: &mut R) -> Result<Plan> {
    check_variables("factorial", &spec.factorial)?;
    check_variables("list", &spec.list)?;

    let factorial_n = if spec.factorial.is_empty() {
        0
    } else {
        spec.factorial.iter().map(|v| v.levels.len()).product()
    };

    let list_n = if spec.list.is_empty() {
        0
    } else {
        let long: BTreeSet<usize> = spec
            .list
            .iter()
            .map(|v| v.levels.len())
            .filter(|n| *n > 1)
            .collect();
        if long.len() > 1 {
            let detail: Vec<String> = spec
                .list
                .iter()
                .map(|v| format!("{}={}", v.name, v.levels.len()))
                .collect();
            return Err(GustavError::config(format!(
                "list variables must have 1 level or a common length ({})",
                detail.join(", ")
            )));
        }
        long.into_iter().next().unwrap_or(1)
    };

    let mut names: Vec<String> = spec.factorial.iter().map(|v| v.name.clone()).collect();
    for var in &spec.list {
        if !names.contains(&var.name) {
            names.push(var.name.clone());
        }
    }

    let mut levels_by_cond: BTreeMap<String, Vec<String>> = BTreeMap::new();

    // Odometer unrolling: the last variable changes fastest.
    for (i, var) in spec.factorial.iter().enumerate() {
        let period: usize = spec.factorial[i + 1..]
            .iter()
            .map(|v| v.levels.len())
            .product();
        let column = (0..factorial_n)
            .map(|row| var.levels[(row / period) % var.levels.len()].clone())
            .collect();
        levels_by_cond.insert(var.name.clone(), column);
    }

    let list_by_name: BTreeMap<&str, &Variable> =
        spec.list.iter().map(|v| (v.name.as_str(), v)).collect();

    for var in &spec.factorial {
        if list_by_name.contains_key(var.name.as_str()) || list_n == 0 {
            continue;
        }
        if var.levels.len() > 1 {
            return Err(GustavError::config(format!(
                "factorial variable '{}' has {} levels but no level for the list conditions",
                var.name,
                var.levels.len()
            )));
        }
        let column = levels_by_cond.entry(var.name.clone()).or_default();
        column.extend(std::iter::repeat(var.levels[0].clone()).take(list_n));
    }

    for var in &spec.list {
        let column = levels_by_cond.entry(var.name.clone()).or_default();
        if column.len() < factorial_n {
            // List-only variable: it needs a level for the factorial conditions too.
            if var.levels.len() > 1 {
                return Err(GustavError::config(format!(
                    "list variable '{}' has {} levels but no level for the factorial conditions",
                    var.name,
                    var.levels.len()
                )));
            }
            column.extend(std::iter::repeat(var.levels[0].clone()).take(factorial_n));
        }
        for pos in 0..list_n {
            let level = if var.levels.len() == 1 {
                &var.levels[0]
            } else {
                &var.levels[pos]
            };
            column.push(level.clone());
        }
    }

    let total = factorial_n + list_n;
    // An experiment without variables still runs one condition.
    let (factorial_n, total) = if total == 0 { (1, 1) } else { (factorial_n, total) };

    let mut ignore = BTreeSet::new();
    for c in &spec.ignore {
        if *c == 0 || *c > total {
            return Err(GustavError::config(format!(
                "ignored condition {} is out of range (1..={})",
                c, total
            )));
        }
        ignore.insert(c - 1);
    }

    let order: Vec<usize> = match &spec.order {
        OrderPolicy::Natural | OrderPolicy::Prompt => (0..total).collect(),
        OrderPolicy::Random => {
            let mut order: Vec<usize> = (0..total).collect();
            order.shuffle(rng);
            order
        }
        OrderPolicy::Menu => Vec::new(),
        OrderPolicy::Explicit(range) => {
            if let Some(max) = range.max_index() {
                if max >= total {
                    return Err(GustavError::config(format!(
                        "order references condition {} but only {} exist",
                        max + 1,
                        total
                    )));
                }
            }
            range.resolve(rng)
        }
    };
    let order = if matches!(spec.order, OrderPolicy::Prompt) {
        order
    } else {
        order.into_iter().filter(|c| !ignore.contains(c)).collect()
    };

    Ok(Plan {
        names,
        levels_by_cond,
        factorial_n,
        list_n,
        order,
        policy: spec.order.clone(),
        ignore,
    })
}
