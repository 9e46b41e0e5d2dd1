use std::path::Path;

use crate::storage::btree::BPlusTree;
use crate::storage::nodes::{NodeTable, Term};
use crate::storage::tuple::NodeTupleTable;
use crate::store::StoreConnection;
use crate::txn::Transaction;
use crate::types::{NodeId, TxnMode};
use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_location;
use crate::admin::Result;

const MAX_FINDINGS: usize = 32;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Structural checks of every index.
    Fast,
    /// Adds the term dictionary round trip and tuple id checks.
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Non-critical issue that may indicate a problem.
    Warning,
    /// Critical issue indicating data corruption or integrity failure.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

impl VerifyFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Error,
            message: message.into(),
        }
    }

    fn info(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Info,
            message: message.into(),
        }
    }
}

/// Statistics collected during the verification process.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Indexes whose structure was walked.
    pub indexes_checked: u64,
    /// Records found across every index.
    pub index_records: u64,
    /// Dictionary entries resolved back to their id.
    pub terms_checked: u64,
    /// Triples seen in the primary triple index.
    pub triples: u64,
    /// Quads seen in the primary quad index.
    pub quads: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// The verification level that was performed.
    pub level: VerifyLevel,
    /// Whether verification passed without finding any issues.
    pub success: bool,
    /// List of issues discovered during verification.
    pub findings: Vec<VerifyFinding>,
    /// Statistics about the data structures examined.
    pub counts: VerifyCounts,
}

/// Verifies the dataset stored in `path`.
///
/// Every index is walked for ordering, occupancy and shape. Each tuple
/// table must hold the same number of entries in all of its indexes. At
/// [`VerifyLevel::Full`] every dictionary entry is decoded and looked up
/// again, and every id in the primary tuple indexes must resolve.
///
/// # Errors
///
/// Returns an error if the dataset cannot be opened. Problems found inside
/// the dataset are reported as findings instead.
pub fn verify(
    path: impl AsRef<Path>,
    opts: &AdminOpenOptions,
    level: VerifyLevel,
) -> Result<VerifyReport> {
    let conn = open_location(path.as_ref(), opts)?;
    let report = verify_connection(&conn, level);
    conn.close()?;
    report
}

/// Runs [`verify`] against an open connection.
pub fn verify_connection(conn: &StoreConnection, level: VerifyLevel) -> Result<VerifyReport> {
    let storage = conn.storage();
    let mut findings = Vec::new();
    let mut counts = VerifyCounts::default();
    let txn = conn.begin(TxnMode::Read)?;

    for tree in storage.trees() {
        check_tree(&txn, tree, &mut findings, &mut counts);
    }
    check_index_sizes(&txn, "triple", storage.triples(), &mut findings);
    check_index_sizes(&txn, "quad", storage.quads(), &mut findings);

    if level == VerifyLevel::Full {
        check_dictionary(&txn, storage.nodes(), &mut findings, &mut counts);
        counts.triples = check_tuple_ids(&txn, "triple", storage.triples(), &mut findings);
        counts.quads = check_tuple_ids(&txn, "quad", storage.quads(), &mut findings);
    } else {
        push_info(&mut findings, "fast level: dictionary and tuple ids not checked");
    }
    txn.end()?;

    let success = findings
        .iter()
        .all(|finding| finding.severity != VerifySeverity::Error);
    Ok(VerifyReport {
        level,
        success,
        findings,
        counts,
    })
}

fn check_tree(
    txn: &Transaction,
    tree: &BPlusTree,
    findings: &mut Vec<VerifyFinding>,
    counts: &mut VerifyCounts,
) {
    counts.indexes_checked += 1;
    match tree.check(txn) {
        Ok(report) => counts.index_records += report.records,
        Err(err) => push_error(findings, format!("index {}: {err}", tree.label())),
    }
}

fn check_index_sizes(
    txn: &Transaction,
    table: &str,
    tuples: &NodeTupleTable,
    findings: &mut Vec<VerifyFinding>,
) {
    let indexes = tuples.tuple_table().indexes();
    let mut sizes = Vec::with_capacity(indexes.len());
    for index in indexes {
        match index.tree().size(txn) {
            Ok(size) => sizes.push((index.name(), size)),
            Err(err) => {
                push_error(findings, format!("{table} index {}: {err}", index.name()));
                return;
            }
        }
    }
    if let Some(&(primary, expected)) = sizes.first() {
        for &(name, size) in &sizes[1..] {
            if size != expected {
                push_error(
                    findings,
                    format!("{table} index {name} holds {size} entries, {primary} holds {expected}"),
                );
            }
        }
    }
}

fn check_dictionary(
    txn: &Transaction,
    nodes: &NodeTable,
    findings: &mut Vec<VerifyFinding>,
    counts: &mut VerifyCounts,
) {
    match (nodes.forward().size(txn), nodes.reverse().size(txn)) {
        (Ok(forward), Ok(reverse)) if forward != reverse => push_error(
            findings,
            format!("node2id holds {forward} entries, id2node holds {reverse}"),
        ),
        (Err(err), _) | (_, Err(err)) => {
            push_error(findings, format!("dictionary size: {err}"));
            return;
        }
        _ => {}
    }
    let entries = match nodes.reverse().find_range(txn, None, None) {
        Ok(iter) => iter,
        Err(err) => {
            push_error(findings, format!("id2node scan: {err}"));
            return;
        }
    };
    for (expected, entry) in (0u64..).zip(entries) {
        let record = match entry {
            Ok(record) => record,
            Err(err) => {
                push_error(findings, format!("id2node scan: {err}"));
                return;
            }
        };
        let (id, offset) = match NodeTable::reverse_entry(&record) {
            Ok(entry) => entry,
            Err(err) => {
                push_error(findings, format!("id2node entry {expected}: {err}"));
                continue;
            }
        };
        if id != NodeId::allocated(expected) {
            push_error(findings, format!("id2node entry {expected} has id {id}"));
            continue;
        }
        let term = match nodes
            .objects()
            .read(txn, offset)
            .and_then(|bytes| Term::decode(&bytes))
        {
            Ok(term) => term,
            Err(err) => {
                push_error(findings, format!("node {id} at offset {offset}: {err}"));
                continue;
            }
        };
        match nodes.lookup(txn, &term) {
            Ok(Some(found)) if found == id => counts.terms_checked += 1,
            Ok(Some(found)) => push_error(findings, format!("{term} maps to {found}, not {id}")),
            Ok(None) => push_error(findings, format!("{term} ({id}) missing from node2id")),
            Err(err) => push_error(findings, format!("lookup of {id}: {err}")),
        }
    }
}

/// Checks that every id in the primary index resolves to a term. Returns
/// the number of tuples seen.
fn check_tuple_ids(
    txn: &Transaction,
    table: &str,
    tuples: &NodeTupleTable,
    findings: &mut Vec<VerifyFinding>,
) -> u64 {
    let ids = tuples.tuple_table();
    let pattern = vec![NodeId::ANY; ids.arity()];
    let iter = match ids.find(txn, &pattern) {
        Ok(iter) => iter,
        Err(err) => {
            push_error(findings, format!("{table} scan: {err}"));
            return 0;
        }
    };
    let mut seen = 0;
    for tuple in iter {
        let tuple = match tuple {
            Ok(tuple) => tuple,
            Err(err) => {
                push_error(findings, format!("{table} scan: {err}"));
                break;
            }
        };
        seen += 1;
        for id in tuple {
            if let Err(err) = tuples.node_table().term_for(txn, id) {
                push_error(findings, format!("{table} #{seen} references {id}: {err}"));
            }
        }
    }
    seen
}

fn push_error(findings: &mut Vec<VerifyFinding>, message: impl Into<String>) {
    if findings.len() < MAX_FINDINGS {
        findings.push(VerifyFinding::error(message));
    }
}

fn push_info(findings: &mut Vec<VerifyFinding>, message: impl Into<String>) {
    if findings.len() < MAX_FINDINGS {
        findings.push(VerifyFinding::info(message));
    }
}
