//! ConfigDocument: typed model of a Prometheus configuration file.
//!
//! The whole file is parsed with `serde_yaml` for validation and structure,
//! while every `scrape_configs` item also keeps its original text. Rendering
//! concatenates the original text of everything fleetwatch does not manage,
//! so comments, formatting and foreign jobs survive a write byte-for-byte.
//! Managed jobs (name starts with the configured prefix) are rendered from
//! `ScrapeJob` values.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

use crate::domain::node::Node;
use crate::domain::types::ScrapeTarget;

const SCRAPE_CONFIGS_KEY: &str = "scrape_configs";
const DEFAULT_ITEM_INDENT: usize = 2;

/// Written when no configuration file exists yet.
pub const DEFAULT_DOCUMENT: &str = "\
global:
  scrape_interval: 15s
  evaluation_interval: 15s

scrape_configs:
";

#[derive(Debug, Error)]
#[error("{0}")]
pub struct DocumentError(String);

/// One scrape job owned by fleetwatch, derived 1:1 from a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub job_key: String,
    pub targets: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub scheme: String,
    pub metrics_path: String,
}

/// How managed jobs are named and shaped.
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub prefix: String,
    pub scheme: String,
    pub metrics_path: String,
}

impl ScrapeJob {
    /// Job for a node, carrying the labels captured at its last successful check.
    pub fn for_node(node: &Node, template: &JobTemplate) -> Self {
        Self {
            job_key: node.job_key(&template.prefix),
            targets: vec![node.target()],
            labels: node
                .published_labels
                .clone()
                .unwrap_or_else(|| node.effective_labels()),
            scheme: template.scheme.clone(),
            metrics_path: template.metrics_path.clone(),
        }
    }

    fn to_prometheus(&self) -> PromScrapeConfig {
        PromScrapeConfig {
            job_name: self.job_key.clone(),
            scheme: Some(self.scheme.clone()),
            metrics_path: Some(self.metrics_path.clone()),
            static_configs: vec![PromStaticConfig {
                targets: self.targets.clone(),
                labels: self.labels.clone(),
            }],
        }
    }

    fn render(&self, indent: usize) -> Result<(String, Value), DocumentError> {
        let prom = self.to_prometheus();
        let value = serde_yaml::to_value(&prom)
            .map_err(|e| DocumentError(format!("serializing job {}: {e}", self.job_key)))?;
        let yaml = serde_yaml::to_string(&vec![prom])
            .map_err(|e| DocumentError(format!("serializing job {}: {e}", self.job_key)))?;

        let pad = " ".repeat(indent);
        let raw = yaml
            .lines()
            .map(|line| format!("{pad}{line}\n"))
            .collect::<String>();
        Ok((raw, value))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PromScrapeConfig {
    job_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metrics_path: Option<String>,
    #[serde(default)]
    static_configs: Vec<PromStaticConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PromStaticConfig {
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
}

/// The `global` section, read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default)]
    pub scrape_interval: Option<String>,
    #[serde(default)]
    pub scrape_timeout: Option<String>,
    #[serde(default)]
    pub evaluation_interval: Option<String>,
}

/// Edits needed to make the document match the desired job set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub upserts: Vec<ScrapeJob>,
    pub removals: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Item {
    job_name: Option<String>,
    value: Value,
    raw: String,
}

#[derive(Debug, Clone)]
enum KeyLine {
    Absent,
    Block(String),
    /// `scrape_configs: []`, rewritten to block style once jobs exist.
    FlowEmpty(String),
}

#[derive(Debug, Clone)]
pub struct ConfigDocument {
    head: String,
    key_line: KeyLine,
    intro: String,
    item_indent: Option<usize>,
    items: Vec<Item>,
    tail: String,
    global: GlobalSettings,
}

impl ConfigDocument {
    /// Same content as [`DEFAULT_DOCUMENT`].
    pub fn default_document() -> Self {
        let (head, key) = DEFAULT_DOCUMENT.split_at(DEFAULT_DOCUMENT.len() - "scrape_configs:\n".len());
        Self {
            head: head.to_string(),
            key_line: KeyLine::Block(key.to_string()),
            intro: String::new(),
            item_indent: None,
            items: Vec::new(),
            tail: String::new(),
            global: GlobalSettings {
                scrape_interval: Some("15s".to_string()),
                scrape_timeout: None,
                evaluation_interval: Some("15s".to_string()),
            },
        }
    }

    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        let root: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_yaml::from_str(text).map_err(|e| DocumentError(e.to_string()))?
        };

        let (global, jobs) = match &root {
            Value::Null => (GlobalSettings::default(), Vec::new()),
            Value::Mapping(map) => {
                let global = match map.get("global") {
                    None | Some(Value::Null) => GlobalSettings::default(),
                    Some(v) => serde_yaml::from_value(v.clone())
                        .map_err(|e| DocumentError(format!("invalid global section: {e}")))?,
                };
                let jobs = match map.get(SCRAPE_CONFIGS_KEY) {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Sequence(seq)) => seq.clone(),
                    Some(_) => {
                        return Err(DocumentError(format!("{SCRAPE_CONFIGS_KEY} is not a list")))
                    }
                };
                (global, jobs)
            }
            _ => return Err(DocumentError("top level is not a mapping".to_string())),
        };

        let mut job_names = Vec::with_capacity(jobs.len());
        for (i, job) in jobs.iter().enumerate() {
            let Value::Mapping(map) = job else {
                return Err(DocumentError(format!(
                    "{SCRAPE_CONFIGS_KEY}[{i}] is not a mapping"
                )));
            };
            job_names.push(map.get("job_name").and_then(Value::as_str).map(str::to_string));
        }

        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        let Some(key_idx) = lines.iter().position(|l| is_key_line(l)) else {
            if !jobs.is_empty() {
                return Err(DocumentError(format!(
                    "unsupported {SCRAPE_CONFIGS_KEY} layout"
                )));
            }
            return Ok(Self {
                head: text.to_string(),
                key_line: KeyLine::Absent,
                intro: String::new(),
                item_indent: None,
                items: Vec::new(),
                tail: String::new(),
                global,
            });
        };

        let key_text = lines[key_idx].to_string();
        let key_line = match inline_value(&key_text) {
            "" => KeyLine::Block(key_text),
            "[]" => KeyLine::FlowEmpty(key_text),
            _ => {
                return Err(DocumentError(format!(
                    "unsupported inline {SCRAPE_CONFIGS_KEY} value; use a block list"
                )))
            }
        };

        // Find where the block ends and how its items are indented.
        let mut item_indent = None;
        let mut end = lines.len();
        for (j, line) in lines.iter().enumerate().skip(key_idx + 1) {
            if is_blank_or_comment(line) {
                continue;
            }
            let indent = indent_of(line);
            let content = line.trim();
            if indent == 0 && (content.starts_with("---") || content.starts_with("...")) {
                end = j;
                break;
            }
            match item_indent {
                None if is_item_start(content) && !matches!(key_line, KeyLine::FlowEmpty(_)) => {
                    item_indent = Some(indent);
                }
                None if indent == 0 => {
                    end = j;
                    break;
                }
                None => {
                    return Err(DocumentError(format!(
                        "unsupported {SCRAPE_CONFIGS_KEY} layout at line {}",
                        j + 1
                    )))
                }
                Some(ind) => {
                    if indent < ind || (indent == ind && !is_item_start(content)) {
                        end = j;
                        break;
                    }
                }
            }
        }

        // Trailing blank/comment lines belong to whatever follows the block.
        let mut block_end = end;
        while block_end > key_idx + 1 && is_blank_or_comment(lines[block_end - 1]) {
            block_end -= 1;
        }

        let mut intro = String::new();
        let mut raws: Vec<String> = Vec::new();
        if let Some(ind) = item_indent {
            for line in &lines[key_idx + 1..block_end] {
                let starts_item = !is_blank_or_comment(line)
                    && indent_of(line) == ind
                    && is_item_start(line.trim());
                if starts_item {
                    let carried = raws.last_mut().map(|prev| split_trailing_comments(prev, ind));
                    raws.push(carried.unwrap_or_default());
                }
                match raws.last_mut() {
                    Some(raw) => raw.push_str(line),
                    None => intro.push_str(line),
                }
            }
        } else {
            block_end = key_idx + 1;
        }

        if raws.len() != jobs.len() {
            return Err(DocumentError(format!(
                "unsupported {SCRAPE_CONFIGS_KEY} layout ({} items found, {} expected)",
                raws.len(),
                jobs.len()
            )));
        }

        let items = raws
            .into_iter()
            .zip(jobs)
            .zip(job_names)
            .map(|((raw, value), job_name)| Item {
                job_name,
                value,
                raw,
            })
            .collect();

        Ok(Self {
            head: lines[..key_idx].concat(),
            key_line,
            intro,
            item_indent,
            items,
            tail: lines[block_end..].concat(),
            global,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.head.len() + self.tail.len() + 256);
        push_piece(&mut out, &self.head);

        match &self.key_line {
            KeyLine::Absent if self.items.is_empty() => {}
            KeyLine::Absent => push_piece(&mut out, &format!("{SCRAPE_CONFIGS_KEY}:\n")),
            KeyLine::Block(line) => push_piece(&mut out, line),
            KeyLine::FlowEmpty(line) if self.items.is_empty() => push_piece(&mut out, line),
            KeyLine::FlowEmpty(line) => {
                let ending = if line.ends_with("\r\n") { "\r\n" } else { "\n" };
                push_piece(&mut out, &format!("{SCRAPE_CONFIGS_KEY}:{ending}"));
            }
        }

        push_piece(&mut out, &self.intro);
        for item in &self.items {
            push_piece(&mut out, &item.raw);
        }
        push_piece(&mut out, &self.tail);
        out
    }

    pub fn global(&self) -> &GlobalSettings {
        &self.global
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.items
            .iter()
            .filter_map(|i| i.job_name.as_deref())
            .collect()
    }

    /// Compute upserts (missing or different) and removals (managed, not desired).
    pub fn plan(&self, desired: &[ScrapeJob], prefix: &str) -> Result<ReconcilePlan, DocumentError> {
        let mut plan = ReconcilePlan::default();
        let mut desired_keys = BTreeSet::new();

        for job in desired {
            if !desired_keys.insert(job.job_key.as_str()) {
                continue;
            }
            let wanted = serde_yaml::to_value(job.to_prometheus())
                .map_err(|e| DocumentError(format!("serializing job {}: {e}", job.job_key)))?;
            let present: Vec<&Item> = self
                .items
                .iter()
                .filter(|i| i.job_name.as_deref() == Some(job.job_key.as_str()))
                .collect();
            let identical = present.len() == 1 && present[0].value == wanted;
            if !identical {
                plan.upserts.push(job.clone());
            }
        }

        let mut removed = BTreeSet::new();
        for name in self.job_names() {
            if name.starts_with(prefix) && !desired_keys.contains(name) && removed.insert(name) {
                plan.removals.push(name.to_string());
            }
        }

        Ok(plan)
    }

    pub fn apply(&mut self, plan: &ReconcilePlan) -> Result<(), DocumentError> {
        for name in &plan.removals {
            self.remove(name);
        }
        for job in &plan.upserts {
            self.upsert(job)?;
        }
        Ok(())
    }

    /// Replace the job with the same name in place (dropping duplicates), or append it.
    pub fn upsert(&mut self, job: &ScrapeJob) -> Result<(), DocumentError> {
        let indent = self.item_indent.unwrap_or(DEFAULT_ITEM_INDENT);
        let (raw, value) = job.render(indent)?;
        let item = Item {
            job_name: Some(job.job_key.clone()),
            value,
            raw,
        };

        let mut positions = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, i)| i.job_name.as_deref() == Some(job.job_key.as_str()))
            .map(|(idx, _)| idx);

        match positions.next() {
            Some(first) => {
                let duplicates: Vec<usize> = positions.collect();
                let leading = leading_comments(&self.items[first].raw);
                let mut item = item;
                item.raw.insert_str(0, &leading);
                self.items[first] = item;
                for idx in duplicates.into_iter().rev() {
                    self.items.remove(idx);
                }
            }
            None => {
                self.item_indent.get_or_insert(indent);
                self.items.push(item);
            }
        }
        Ok(())
    }

    /// Remove every job with this name. Returns whether anything was removed.
    pub fn remove(&mut self, job_name: &str) -> bool {
        let before = self.items.len();
        self.items
            .retain(|i| i.job_name.as_deref() != Some(job_name));
        self.items.len() != before
    }

    /// Every static target in the document, managed or not.
    pub fn scrape_targets(&self, prefix: &str) -> Vec<ScrapeTarget> {
        let mut out = Vec::new();
        for item in &self.items {
            let Ok(job) = serde_yaml::from_value::<PromScrapeConfig>(item.value.clone()) else {
                continue;
            };
            let managed = job.job_name.starts_with(prefix);
            let scheme = job.scheme.clone().unwrap_or_else(|| "http".to_string());
            for sc in &job.static_configs {
                for target in &sc.targets {
                    out.push(ScrapeTarget {
                        job_name: job.job_name.clone(),
                        target: target.clone(),
                        labels: sc.labels.clone(),
                        scheme: scheme.clone(),
                        managed,
                    });
                }
            }
        }
        out
    }
}

fn is_key_line(line: &str) -> bool {
    line.strip_prefix(SCRAPE_CONFIGS_KEY)
        .and_then(|rest| rest.strip_prefix(':'))
        .is_some_and(|rest| rest.is_empty() || rest.starts_with([' ', '\t', '\r', '\n']))
}

/// Value after `scrape_configs:` with any comment stripped.
fn inline_value(line: &str) -> &str {
    let rest = &line[SCRAPE_CONFIGS_KEY.len() + 1..];
    let rest = match rest.find(" #") {
        Some(pos) => &rest[..pos],
        None => rest,
    };
    rest.trim()
}

fn is_blank_or_comment(line: &str) -> bool {
    let t = line.trim();
    t.is_empty() || t.starts_with('#')
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn is_item_start(content: &str) -> bool {
    content == "-" || content.starts_with("- ")
}

/// Detach trailing blank lines and shallow comments from `raw`; they
/// introduce the next item rather than close this one.
fn split_trailing_comments(raw: &mut String, item_indent: usize) -> String {
    let lines: Vec<&str> = raw.split_inclusive('\n').collect();
    let mut keep = lines.len();
    while keep > 1 {
        let line = lines[keep - 1];
        let shallow_comment = line.trim().starts_with('#') && indent_of(line) <= item_indent;
        if line.trim().is_empty() || shallow_comment {
            keep -= 1;
        } else {
            break;
        }
    }
    let carried = lines[keep..].concat();
    let kept = lines[..keep].concat();
    *raw = kept;
    carried
}

fn leading_comments(raw: &str) -> String {
    raw.split_inclusive('\n')
        .take_while(|l| is_blank_or_comment(l))
        .collect()
}

fn push_piece(out: &mut String, piece: &str) {
    if piece.is_empty() {
        return;
    }
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(piece);
}
