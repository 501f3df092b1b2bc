// Where-filter evaluation
//
// A filter is a tree of boolean groups over leaf comparisons. Leaves
// may first run the field value through a modifier (arithmetic against
// a literal or another field, a date function, set membership, or a
// registered callback) before comparing. A group with no decisive
// result passes - `&&` only fails on an explicit false, `||` only
// succeeds on an explicit true, and exhausting the items means pass.

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::record::{as_num, loose_cmp, loose_eq, Record};

/// One node of a filter tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Group(ConditionGroup),
    Leaf(Comparison),
}

/// `{type: "&&"|"||", item: [...]}` boolean group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(rename = "type")]
    pub op: BoolOp,
    #[serde(rename = "item", default)]
    pub items: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolOp {
    #[serde(rename = "&&", alias = "and")]
    And,
    #[serde(rename = "||", alias = "or")]
    Or,
}

/// Leaf comparison `{field, typeM?, mValue?, fun?, arg?, type?, value}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparison {
    pub field: String,
    #[serde(rename = "typeM", default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<Modifier>,
    #[serde(rename = "mValue", default, skip_serializing_if = "Option::is_none")]
    pub modifier_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fun: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg: Option<Value>,
    #[serde(rename = "type", default)]
    pub op: CompareOp,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "!=")]
    Ne,
    #[default]
    #[serde(rename = "=")]
    Eq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modifier {
    #[serde(rename = "%", alias = "mod")]
    Mod,
    #[serde(rename = ">>")]
    Shr,
    #[serde(rename = "<<")]
    Shl,
    #[serde(rename = "-")]
    Sub,
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "*", alias = "x")]
    Mul,
    #[serde(rename = "/")]
    Div,
    #[serde(rename = "func")]
    Func,
}

/// Callback signature for registered `func` modifiers. A `None` result
/// makes the leaf evaluate as non-matching without aborting the tree.
pub type ModifierFn = fn(&Value, Option<&Value>) -> Option<Value>;

/// Registry of named callbacks reachable from `func` modifiers.
#[derive(Default)]
pub struct FuncRegistry {
    funcs: HashMap<String, ModifierFn>,
}

impl FuncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, func: ModifierFn) {
        self.funcs.insert(name.into(), func);
    }

    fn get(&self, name: &str) -> Option<ModifierFn> {
        self.funcs.get(name).copied()
    }
}

/// Evaluate a filter tree against a record.
pub fn matches(cond: &Condition, record: &Record, funcs: &FuncRegistry) -> bool {
    match cond {
        Condition::Group(group) => eval_group(group, record, funcs),
        Condition::Leaf(leaf) => eval_leaf(leaf, record, funcs),
    }
}

fn eval_group(group: &ConditionGroup, record: &Record, funcs: &FuncRegistry) -> bool {
    for item in &group.items {
        // Nested groups recurse into the nested item itself.
        let result = matches(item, record, funcs);
        match group.op {
            BoolOp::And if !result => return false,
            BoolOp::Or if result => return true,
            _ => {}
        }
    }

    // No decisive result: pass.
    true
}

fn eval_leaf(leaf: &Comparison, record: &Record, funcs: &FuncRegistry) -> bool {
    let raw = record.get(&leaf.field);

    let value = match &leaf.modifier {
        None => raw.cloned(),
        Some(Modifier::Func) => match leaf.fun.as_deref() {
            // Membership checks bypass the comparator entirely.
            Some("in") => return member_of(raw, leaf.arg.as_ref()),
            Some("not_in") => return !member_of(raw, leaf.arg.as_ref()),
            Some("time_format") | Some("from_unixtime") => {
                raw.and_then(as_num).map(|ts| {
                    Value::String(format_unix_time(ts as i64, leaf.arg.as_ref()))
                })
            }
            Some("unix_timestamp") => raw
                .and_then(|v| v.as_str())
                .and_then(parse_time_string)
                .map(Value::from),
            Some(name) => match (funcs.get(name), raw) {
                (Some(func), Some(value)) => func(value, leaf.arg.as_ref()),
                _ => None,
            },
            None => None,
        },
        Some(op) => apply_arithmetic(*op, raw, leaf.modifier_value.as_ref(), record),
    };

    // A failed modifier or missing field is a non-matching value; the
    // rest of the tree still evaluates.
    match value {
        Some(value) => compare(&value, &leaf.value, leaf.op),
        None => false,
    }
}

fn compare(a: &Value, b: &Value, op: CompareOp) -> bool {
    match op {
        CompareOp::Gt => loose_cmp(a, b) == Ordering::Greater,
        CompareOp::Lt => loose_cmp(a, b) == Ordering::Less,
        CompareOp::Ge => loose_cmp(a, b) != Ordering::Less,
        CompareOp::Le => loose_cmp(a, b) != Ordering::Greater,
        CompareOp::Ne => !loose_eq(a, b),
        CompareOp::Eq => loose_eq(a, b),
    }
}

fn apply_arithmetic(
    op: Modifier,
    raw: Option<&Value>,
    operand: Option<&Value>,
    record: &Record,
) -> Option<Value> {
    let lhs = raw.and_then(as_num)?;
    // The operand is either a numeric literal or the name of another
    // field whose value is used instead.
    let operand = operand?;
    let rhs = match as_num(operand) {
        Some(n) => n,
        None => operand
            .as_str()
            .and_then(|field| record.get(field))
            .and_then(as_num)?,
    };

    let result = match op {
        Modifier::Mod => {
            if rhs as i64 == 0 {
                return None;
            }
            return Some(Value::from((lhs as i64).rem_euclid(rhs as i64)));
        }
        Modifier::Shr => return Some(Value::from((lhs as i64) >> (rhs as i64).clamp(0, 63))),
        Modifier::Shl => return Some(Value::from((lhs as i64) << (rhs as i64).clamp(0, 63))),
        Modifier::Sub => lhs - rhs,
        Modifier::Add => lhs + rhs,
        Modifier::Mul => lhs * rhs,
        Modifier::Div => {
            if rhs == 0.0 {
                return None;
            }
            lhs / rhs
        }
        Modifier::Func => unreachable!("func handled by caller"),
    };

    Some(Value::from(result))
}

fn member_of(field_value: Option<&Value>, arg: Option<&Value>) -> bool {
    let (Some(Value::Array(items)), Some(arg)) = (field_value, arg) else {
        return false;
    };
    items.iter().any(|item| loose_eq(item, arg))
}

/// Format a Unix timestamp with a PHP-style date pattern (`Y-m-d` etc).
fn format_unix_time(ts: i64, pattern: Option<&Value>) -> String {
    let pattern = pattern
        .and_then(|v| v.as_str())
        .unwrap_or("Y-m-d")
        // Legacy SQL-ish placeholders seen in stored definitions.
        .replace("%D", "d")
        .replace('%', "");

    let Some(dt) = Utc.timestamp_opt(ts, 0).single() else {
        return String::new();
    };

    let mut out = String::with_capacity(pattern.len() + 8);
    for ch in pattern.chars() {
        let mapped = match ch {
            'Y' => "%Y",
            'y' => "%y",
            'm' => "%m",
            'd' => "%d",
            'H' => "%H",
            'i' => "%M",
            's' => "%S",
            _ => {
                out.push(ch);
                continue;
            }
        };
        out.push_str(&dt.format(mapped).to_string());
    }
    out
}

/// Parse a date string to a Unix timestamp.
fn parse_time_string(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc().timestamp());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}
