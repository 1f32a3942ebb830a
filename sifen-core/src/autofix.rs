//! Bounded repair of schema-order rejections.
//!
//! When SIFEN rejects a document with a message of the form "expected
//! element E, found element F" and both elements belong to a group whose
//! child order is known, the document is fixed locally (E moved or
//! inserted in front of F) and resubmitted as a new signature in a new
//! batch. Nothing is ever deleted.
use std::{fmt, future::Future};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    api::DocumentOutcome,
    config::Config,
    document::{UnsignedDocument, xml},
    pipeline::Submission,
    status::{LifecycleState, Outcome},
};

#[derive(Debug, Error)]
pub enum AutoFixError {
    #[error("document still rejected after {max_iterations} repair attempts")]
    IterationsExhausted {
        max_iterations: u32,
        history: Vec<RepairStep>,
    },
    #[error("submission failed: {0}")]
    Submission(#[source] Box<crate::Error>),
    #[error("repair produced an unusable document: {0}")]
    Repair(String),
}

/// Parsed "expected E, found F" rejection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructuralHint {
    pub expected: String,
    pub found: String,
}

/// A container element whose child order is fixed by the schema.
#[derive(Debug)]
pub struct ElementGroup {
    pub name: &'static str,
    pub order: &'static [&'static str],
    /// Reorder every known child in one pass instead of only moving E.
    pub normalize: bool,
    /// Values that can be inserted for a missing child without changing meaning.
    pub defaults: &'static [(&'static str, &'static str)],
}

impl ElementGroup {
    fn position(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|candidate| *candidate == name)
    }

    fn default_for(&self, name: &str) -> Option<&'static str> {
        self.defaults
            .iter()
            .find(|(element, _)| *element == name)
            .map(|(_, value)| *value)
    }
}

const TOT_SUB_ORDER: &[&str] = &[
    "dSubExe",
    "dSubExo",
    "dSub5",
    "dSub10",
    "dTotOpe",
    "dTotDesc",
    "dTotDescGlotem",
    "dTotAntItem",
    "dTotAnt",
    "dPorcDescTotal",
    "dDescTotal",
    "dAnticipo",
    "dRedon",
    "dComi",
    "dTotGralOpe",
    "dIVA5",
    "dIVA10",
    "dLiqTotIVA5",
    "dLiqTotIVA10",
    "dIVAComi",
    "dTotIVA",
    "dBaseGrav5",
    "dBaseGrav10",
    "dTBasGraIVA",
    "dTotalGs",
];

// dTotalGs only exists for foreign-currency documents and is left alone.
const TOT_SUB_DEFAULTS: &[(&str, &str)] = &[
    ("dSubExe", "0"),
    ("dSubExo", "0"),
    ("dSub5", "0"),
    ("dSub10", "0"),
    ("dTotOpe", "0"),
    ("dTotDesc", "0"),
    ("dTotDescGlotem", "0"),
    ("dTotAntItem", "0"),
    ("dTotAnt", "0"),
    ("dPorcDescTotal", "0"),
    ("dDescTotal", "0"),
    ("dAnticipo", "0"),
    ("dRedon", "0"),
    ("dComi", "0"),
    ("dTotGralOpe", "0"),
    ("dIVA5", "0"),
    ("dIVA10", "0"),
    ("dLiqTotIVA5", "0"),
    ("dLiqTotIVA10", "0"),
    ("dIVAComi", "0"),
    ("dTotIVA", "0"),
    ("dBaseGrav5", "0"),
    ("dBaseGrav10", "0"),
    ("dTBasGraIVA", "0"),
];

pub const GROUPS: [ElementGroup; 4] = [
    ElementGroup {
        name: "gTotSub",
        order: TOT_SUB_ORDER,
        normalize: true,
        defaults: TOT_SUB_DEFAULTS,
    },
    ElementGroup {
        name: "gOpeDE",
        order: &["iTipEmi", "dDesTipEmi", "dCodSeg", "dInfoEmi", "dInfoFisc"],
        normalize: false,
        defaults: &[],
    },
    ElementGroup {
        name: "gTimb",
        order: &[
            "iTiDE", "dDesTiDE", "dNumTim", "dEst", "dPunExp", "dNumDoc", "dSerieNum", "dFeIniT",
        ],
        normalize: false,
        defaults: &[],
    },
    ElementGroup {
        name: "gCamIVA",
        order: &[
            "iAfecIVA",
            "dDesAfecIVA",
            "dPropIVA",
            "dTasaIVA",
            "dBasGravIVA",
            "dLiqIVAItem",
            "dBasExe",
        ],
        normalize: false,
        defaults: &[("dBasExe", "0")],
    },
];

/// Group that contains both elements of the hint.
pub fn group_for(hint: &StructuralHint) -> Option<&'static ElementGroup> {
    GROUPS
        .iter()
        .find(|group| group.position(&hint.expected).is_some() && group.position(&hint.found).is_some())
}

/// Extracts the expected/found pair from a validation message.
///
/// Understood shapes:
/// - `expected element E, found element F`
/// - `se esperaba el elemento E, se encontró el elemento F`
/// - `Invalid content was found starting with element 'F'. One of '{"ns":E}' is expected.`
///
/// Names may be quoted, prefixed or carry a `{namespace}`. Anything else
/// returns `None`.
pub fn parse_structural_message(message: &str) -> Option<StructuralHint> {
    let lowered = message.to_ascii_lowercase();
    let pairs = [
        ("expected element", "found element"),
        ("se esperaba el elemento", "se encontró el elemento"),
        ("se esperaba el elemento", "se encontro el elemento"),
    ];
    for (expected_marker, found_marker) in pairs {
        let Some(start) = lowered.find(expected_marker) else {
            continue;
        };
        let after_expected = start + expected_marker.len();
        let Some(found_offset) = lowered[after_expected..].find(found_marker) else {
            continue;
        };
        let expected = element_name(&message[after_expected..after_expected + found_offset])?;
        let found = element_name(&message[after_expected + found_offset + found_marker.len()..])?;
        return Some(StructuralHint { expected, found });
    }
    xerces_shape(message, &lowered)
}

fn xerces_shape(message: &str, lowered: &str) -> Option<StructuralHint> {
    let marker = "starting with element";
    let start = lowered.find(marker)? + marker.len();
    let found = element_name(&message[start..])?;
    let one_of = start + lowered[start..].find("one of")? + "one of".len();
    let rest = &message[one_of..];
    let open = rest.find('{')?;
    let close = open + rest[open..].find('}')?;
    let candidates: Vec<&str> = rest[open + 1..close].split(',').collect();
    let [only] = candidates.as_slice() else {
        return None;
    };
    let expected = only.rsplit(':').next().and_then(element_name)?;
    Some(StructuralHint { expected, found })
}

fn element_name(text: &str) -> Option<String> {
    let quotes: &[char] = &['\'', '"', '`', '“', '”', '‘', '’', '<', '('];
    let mut rest = text.trim_start().trim_start_matches(quotes);
    if let Some(stripped) = rest.strip_prefix('{') {
        rest = &stripped[stripped.find('}')? + 1..];
    }
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '.' | '-')))
        .unwrap_or(rest.len());
    let qualified = &rest[..end];
    let local = qualified.rsplit(':').next()?;
    if local.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        Some(local.to_string())
    } else {
        None
    }
}

/// What a repair did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairAction {
    Inserted {
        element: String,
        before: String,
        value: String,
    },
    Moved {
        element: String,
        before: String,
    },
    Normalized {
        group: &'static str,
        inserted: Option<String>,
    },
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairAction::Inserted {
                element,
                before,
                value,
            } => write!(f, "inserted {element}={value} before {before}"),
            RepairAction::Moved { element, before } => write!(f, "moved {element} before {before}"),
            RepairAction::Normalized {
                group,
                inserted: Some(element),
            } => write!(f, "reordered {group}, inserted {element}"),
            RepairAction::Normalized { group, inserted: None } => write!(f, "reordered {group}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repair {
    pub xml: String,
    pub action: RepairAction,
}

/// Applies the hint to an unsigned document. `Ok(None)` when the hint is
/// not about a known group or there is nothing safe to change.
///
/// The result depends only on the input, so the same rejection always
/// yields the same document.
pub fn repair(document: &str, hint: &StructuralHint) -> Result<Option<Repair>, AutoFixError> {
    let Some(group) = group_for(hint) else {
        return Ok(None);
    };
    let doc = xml::parse(document).map_err(AutoFixError::Repair)?;
    let ctx = xml::context(&doc).map_err(AutoFixError::Repair)?;
    let instances = xml::nodes(&ctx, &format!("//s:DE//s:{}", group.name)).map_err(AutoFixError::Repair)?;

    let mut action = None;
    for mut instance in instances {
        let applied = if group.normalize {
            normalize(&doc, &mut instance, group, hint)?
        } else {
            move_or_insert(&doc, &instance, group, hint)?
        };
        if applied.is_some() {
            action = applied;
        }
    }
    let Some(action) = action else {
        return Ok(None);
    };
    let xml = xml::compact_root(&doc).map_err(AutoFixError::Repair)?;
    Ok(Some(Repair { xml, action }))
}

fn move_or_insert(
    doc: &libxml::tree::Document,
    instance: &libxml::tree::Node,
    group: &ElementGroup,
    hint: &StructuralHint,
) -> Result<Option<RepairAction>, AutoFixError> {
    let Some(mut found) = xml::child_named(instance, &hint.found) else {
        return Ok(None);
    };
    if let Some(mut expected) = xml::child_named(instance, &hint.expected) {
        let already_before = found
            .get_prev_sibling()
            .is_some_and(|prev| prev.get_name() == hint.expected && prev.is_element_node());
        if already_before {
            return Ok(None);
        }
        expected.unlink();
        found
            .add_prev_sibling(&mut expected)
            .map_err(|e| AutoFixError::Repair(e.to_string()))?;
        return Ok(Some(RepairAction::Moved {
            element: hint.expected.clone(),
            before: hint.found.clone(),
        }));
    }
    let Some(value) = group.default_for(&hint.expected) else {
        return Ok(None);
    };
    let mut inserted =
        xml::new_element_like(doc, &found, &hint.expected, value).map_err(AutoFixError::Repair)?;
    found
        .add_prev_sibling(&mut inserted)
        .map_err(|e| AutoFixError::Repair(e.to_string()))?;
    Ok(Some(RepairAction::Inserted {
        element: hint.expected.clone(),
        before: hint.found.clone(),
        value: value.to_string(),
    }))
}

fn normalize(
    doc: &libxml::tree::Document,
    instance: &mut libxml::tree::Node,
    group: &'static ElementGroup,
    hint: &StructuralHint,
) -> Result<Option<RepairAction>, AutoFixError> {
    let mut inserted = None;
    if xml::child_named(instance, &hint.expected).is_none() {
        let (Some(value), Some(mut found)) = (
            group.default_for(&hint.expected),
            xml::child_named(instance, &hint.found),
        ) else {
            return Ok(None);
        };
        let mut node =
            xml::new_element_like(doc, &found, &hint.expected, value).map_err(AutoFixError::Repair)?;
        found
            .add_prev_sibling(&mut node)
            .map_err(|e| AutoFixError::Repair(e.to_string()))?;
        inserted = Some(hint.expected.clone());
    }

    let children = xml::element_children(instance);
    let mut sorted = children.clone();
    // stable: unknown children keep their relative order at the end
    sorted.sort_by_key(|child| group.position(&child.get_name()).unwrap_or(usize::MAX));
    let unchanged = sorted
        .iter()
        .map(|node| node.get_name())
        .eq(children.iter().map(|node| node.get_name()));
    if unchanged && inserted.is_none() {
        return Ok(None);
    }
    for mut child in sorted {
        child.unlink();
        instance
            .add_child(&mut child)
            .map_err(|e| AutoFixError::Repair(e.to_string()))?;
    }
    Ok(Some(RepairAction::Normalized {
        group: group.name,
        inserted,
    }))
}

/// One repair round in the loop's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairStep {
    pub iteration: u32,
    pub batch_id: String,
    pub code: String,
    pub message: String,
    pub hint: StructuralHint,
    pub action: RepairAction,
}

/// Something that can submit a document and follow it up.
pub trait SubmissionDriver {
    /// Signs, packages, sends and polls a fresh submission.
    fn submit(
        &self,
        document: &UnsignedDocument,
    ) -> impl Future<Output = Result<Submission, crate::Error>> + Send;

    /// Keeps polling a submission that was left pending.
    fn resume(&self, submission: Submission) -> impl Future<Output = Result<Submission, crate::Error>> + Send;
}

/// Final state of an auto-fix run.
#[derive(Debug)]
pub struct AutoFixReport {
    submission: Submission,
    document: UnsignedDocument,
    history: Vec<RepairStep>,
}

impl AutoFixReport {
    pub fn submission(&self) -> &Submission {
        &self.submission
    }

    pub fn state(&self) -> &LifecycleState {
        self.submission.state()
    }

    pub fn is_approved(&self) -> bool {
        *self.state() == LifecycleState::Concluded(Outcome::Approved)
    }

    /// The document as last submitted, repairs included.
    pub fn document(&self) -> &UnsignedDocument {
        &self.document
    }

    pub fn history(&self) -> &[RepairStep] {
        &self.history
    }
}

/// Submit, track, and repair-and-resubmit on structural rejections.
#[derive(Debug, Clone, Copy)]
pub struct AutoFixLoop {
    max_iterations: u32,
    max_resumes: u32,
}

impl AutoFixLoop {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            max_resumes: 3,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.autofix_max_iterations())
    }

    /// How many times a pending submission is resumed before the run returns
    /// it as still pending.
    pub fn with_max_resumes(mut self, max_resumes: u32) -> Self {
        self.max_resumes = max_resumes;
        self
    }

    pub async fn run<D: SubmissionDriver>(
        &self,
        document: UnsignedDocument,
        driver: &D,
    ) -> Result<AutoFixReport, AutoFixError> {
        let mut document = document;
        let mut history = Vec::new();
        let mut resumes = 0;
        let mut submission = driver.submit(&document).await.map_err(submission_failed)?;

        loop {
            let state = submission.state().clone();
            match state {
                LifecycleState::Submitted | LifecycleState::Pending | LifecycleState::Signed => {
                    if resumes >= self.max_resumes {
                        info!(batch = %submission.batch_id(), "still pending, returning");
                        break;
                    }
                    resumes += 1;
                    submission = driver.resume(submission).await.map_err(submission_failed)?;
                }
                LifecycleState::Concluded(Outcome::Rejected) => {
                    let Some((code, message, hint)) = submission.outcome().and_then(structural_hint) else {
                        break;
                    };
                    if history.len() as u32 >= self.max_iterations {
                        warn!(max_iterations = self.max_iterations, "repair budget used up");
                        return Err(AutoFixError::IterationsExhausted {
                            max_iterations: self.max_iterations,
                            history,
                        });
                    }
                    let Some(repaired) = repair(document.xml(), &hint)? else {
                        info!(expected = %hint.expected, found = %hint.found, "no safe repair");
                        break;
                    };
                    let iteration = history.len() as u32 + 1;
                    info!(iteration, action = %repaired.action, "resubmitting repaired document");
                    history.push(RepairStep {
                        iteration,
                        batch_id: submission.batch_id().as_str().to_string(),
                        code,
                        message,
                        hint,
                        action: repaired.action,
                    });
                    document = UnsignedDocument::from_xml(repaired.xml)
                        .map_err(|e| AutoFixError::Repair(e.to_string()))?;
                    resumes = 0;
                    submission = driver.submit(&document).await.map_err(submission_failed)?;
                }
                LifecycleState::Concluded(Outcome::Approved) | LifecycleState::Error(_) => break,
            }
        }

        Ok(AutoFixReport {
            submission,
            document,
            history,
        })
    }
}

fn structural_hint(outcome: &DocumentOutcome) -> Option<(String, String, StructuralHint)> {
    outcome.results().iter().find_map(|result| {
        parse_structural_message(&result.message)
            .map(|hint| (result.code.clone(), result.message.clone(), hint))
    })
}

fn submission_failed(error: crate::Error) -> AutoFixError {
    AutoFixError::Submission(Box::new(error))
}
