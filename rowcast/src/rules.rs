//! Compilation of tracking rules against the schema descriptor.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use rowcast_config::{ColumnIgnore, TrackKey, TrackRule, TrackingDocument};
use rowcast_postgres::types::{EventKind, SchemaDescriptor};

use crate::error::{ErrorKind, RowcastResult};
use crate::expr::{ExprType, Program, TypeScope};
use crate::rowcast_error;

/// A compiled tracking rule.
#[derive(Debug)]
pub enum CompiledRule {
    Simple {
        event: String,
        properties: Vec<(String, Program)>,
    },
    Conditional {
        cond: Program,
        branches: BTreeMap<String, Vec<(String, Program)>>,
    },
}

/// All compiled rules, keyed by `<table>.<op>`, plus the descriptor rows are
/// decoded against. Built once at startup and immutable afterwards.
#[derive(Debug)]
pub struct RuleSet {
    rules: HashMap<String, CompiledRule>,
    descriptor: Option<Arc<SchemaDescriptor>>,
}

impl RuleSet {
    /// Compiles every rule of the tracking document.
    ///
    /// With a descriptor, compilation is strict: row variables are typed by
    /// the table shape and unknown fields, unknown conditional branches and
    /// ill-typed expressions fail startup. Without a descriptor (lax mode)
    /// row variables are untyped and only declared-event checks apply.
    pub fn compile(
        document: &TrackingDocument,
        descriptor: Option<Arc<SchemaDescriptor>>,
    ) -> RowcastResult<RuleSet> {
        let mut rules = HashMap::with_capacity(document.track.len());

        for (key, rule) in &document.track {
            let parsed = TrackKey::parse(key).map_err(|err| {
                rowcast_error!(ErrorKind::ConfigError, "invalid track key", err)
            })?;

            let compiled = compile_rule(&parsed, rule, descriptor.as_deref()).map_err(|err| {
                rowcast_error!(
                    err.kind(),
                    "failed to compile tracking rule",
                    format!("{key}: {err}")
                )
            })?;
            rules.insert(key.clone(), compiled);
        }

        Ok(RuleSet { rules, descriptor })
    }

    pub fn get(&self, table: &str, kind: EventKind) -> Option<&CompiledRule> {
        self.rules.get(&format!("{table}.{kind}"))
    }

    pub fn descriptor(&self) -> Option<&SchemaDescriptor> {
        self.descriptor.as_deref()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn compile_rule(
    key: &TrackKey,
    rule: &TrackRule,
    descriptor: Option<&SchemaDescriptor>,
) -> RowcastResult<CompiledRule> {
    let row_type = match descriptor {
        Some(descriptor) => {
            let table = descriptor.table(&key.table).ok_or_else(|| {
                rowcast_error!(
                    ErrorKind::SchemaError,
                    "tracked table is not part of the schema",
                    format!("table `{}` was not introspected or is ignored", key.table)
                )
            })?;
            ExprType::Record(Arc::new(table.clone()))
        }
        None => ExprType::Dynamic,
    };

    let mut scope = TypeScope::new();
    scope.bind(key.table.clone(), row_type.clone());
    match key.op.as_str() {
        "insert" => scope.bind("new", row_type),
        "update" => {
            scope.bind("new", row_type.clone());
            scope.bind("old", row_type);
        }
        "delete" => scope.bind("old", row_type),
        _ => unreachable!("track keys are validated before compilation"),
    }

    match rule {
        TrackRule::Simple(simple) => Ok(CompiledRule::Simple {
            event: simple.event.clone(),
            properties: compile_properties(&simple.properties, &scope)?,
        }),
        TrackRule::Conditional(conditional) => {
            let event_names: BTreeSet<String> = conditional.branches.keys().cloned().collect();
            scope.bind("events", ExprType::Events(Arc::new(event_names)));

            let cond = Program::compile(&conditional.cond, &scope)?;
            match cond.output() {
                ExprType::EventRef | ExprType::Null | ExprType::Dynamic => {}
                other => {
                    return Err(rowcast_error!(
                        ErrorKind::ExpressionCompileError,
                        "condition must evaluate to an event reference or null",
                        format!("`{}` evaluates to {}", cond.source(), other)
                    ));
                }
            }

            let mut branches = BTreeMap::new();
            for (event, branch) in &conditional.branches {
                branches.insert(
                    event.clone(),
                    compile_properties(&branch.properties, &scope)?,
                );
            }

            Ok(CompiledRule::Conditional { cond, branches })
        }
    }
}

fn compile_properties(
    properties: &BTreeMap<String, String>,
    scope: &TypeScope,
) -> RowcastResult<Vec<(String, Program)>> {
    let mut compiled = Vec::with_capacity(properties.len());
    for (name, source) in properties {
        compiled.push((name.clone(), Program::compile(source, scope)?));
    }
    Ok(compiled)
}

/// Applies ignore rules to the descriptor before rule compilation: whole
/// tables are dropped, ignored columns disappear from their table shape.
pub fn apply_ignores(
    descriptor: &mut SchemaDescriptor,
    ignore: &BTreeMap<String, ColumnIgnore>,
) {
    for (table, entry) in ignore {
        if entry.is_all() {
            descriptor.remove_table(table);
        } else {
            descriptor.remove_columns(table, entry.columns());
        }
    }
}
