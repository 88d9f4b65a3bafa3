// SPDX-License-Identifier: GPL-3.0-only

//! Named device parameters merged across leases
//!
//! Every lease carries its own preferred value for each registered parameter.
//! The effective value is a left fold of the leases' values through the
//! parameter's combinator, so the combinator must be associative and
//! commutative (max, min, or, and) for the result not to depend on the order
//! leases were acquired in.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::constants::FLOAT_PARAMETER_EPSILON;
use crate::errors::{DeviceError, DeviceResult};

/// Value of a device parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ParameterValue {
    pub fn value_type(&self) -> ParameterType {
        match self {
            ParameterValue::Bool(_) => ParameterType::Bool,
            ParameterValue::Int(_) => ParameterType::Int,
            ParameterValue::Float(_) => ParameterType::Float,
        }
    }

    /// Whether switching from `other` to `self` must reach the hardware.
    ///
    /// Floats compare with a small tolerance, everything else exactly.
    pub fn differs_from(&self, other: &ParameterValue) -> bool {
        match (self, other) {
            (ParameterValue::Float(a), ParameterValue::Float(b)) => {
                (a - b).abs() > FLOAT_PARAMETER_EPSILON
            }
            _ => self != other,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Parse `value` as the given type (`true`/`false`, integers, floats)
    pub fn parse_as(value: &str, value_type: ParameterType) -> Option<Self> {
        let value = value.trim();
        match value_type {
            ParameterType::Bool => match value.to_lowercase().as_str() {
                "true" | "on" | "1" | "yes" => Some(ParameterValue::Bool(true)),
                "false" | "off" | "0" | "no" => Some(ParameterValue::Bool(false)),
                _ => None,
            },
            ParameterType::Int => value.parse().ok().map(ParameterValue::Int),
            ParameterType::Float => value.parse().ok().map(ParameterValue::Float),
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterValue::Bool(v) => write!(f, "{}", v),
            ParameterValue::Int(v) => write!(f, "{}", v),
            ParameterValue::Float(v) => write!(f, "{:.3}", v),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

/// Type of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    Bool,
    Int,
    Float,
}

impl std::fmt::Display for ParameterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterType::Bool => write!(f, "boolean"),
            ParameterType::Int => write!(f, "integer"),
            ParameterType::Float => write!(f, "float"),
        }
    }
}

/// Merge function for one parameter type
#[derive(Clone, Copy)]
pub enum Combinator {
    Bool(fn(bool, bool) -> bool),
    Int(fn(i64, i64) -> i64),
    Float(fn(f64, f64) -> f64),
}

impl Combinator {
    pub fn value_type(&self) -> ParameterType {
        match self {
            Combinator::Bool(_) => ParameterType::Bool,
            Combinator::Int(_) => ParameterType::Int,
            Combinator::Float(_) => ParameterType::Float,
        }
    }

    /// Merge two values, None on a type mismatch
    pub fn combine(&self, a: ParameterValue, b: ParameterValue) -> Option<ParameterValue> {
        match (self, a, b) {
            (Combinator::Bool(f), ParameterValue::Bool(a), ParameterValue::Bool(b)) => {
                Some(ParameterValue::Bool(f(a, b)))
            }
            (Combinator::Int(f), ParameterValue::Int(a), ParameterValue::Int(b)) => {
                Some(ParameterValue::Int(f(a, b)))
            }
            (Combinator::Float(f), ParameterValue::Float(a), ParameterValue::Float(b)) => {
                Some(ParameterValue::Float(f(a, b)))
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for Combinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Combinator({})", self.value_type())
    }
}

/// Stock combinators, all associative and commutative
pub mod combinators {
    pub fn any(a: bool, b: bool) -> bool {
        a || b
    }

    pub fn all(a: bool, b: bool) -> bool {
        a && b
    }

    pub fn max_int(a: i64, b: i64) -> i64 {
        a.max(b)
    }

    pub fn min_int(a: i64, b: i64) -> i64 {
        a.min(b)
    }

    pub fn max_float(a: f64, b: f64) -> f64 {
        a.max(b)
    }

    pub fn min_float(a: f64, b: f64) -> f64 {
        a.min(b)
    }
}

/// Declaration of a parameter registered by a backend
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    name: String,
    default: ParameterValue,
    combinator: Combinator,
}

impl ParameterSpec {
    pub fn bool(name: &str, default: bool, combine: fn(bool, bool) -> bool) -> Self {
        Self {
            name: name.to_string(),
            default: ParameterValue::Bool(default),
            combinator: Combinator::Bool(combine),
        }
    }

    pub fn int(name: &str, default: i64, combine: fn(i64, i64) -> i64) -> Self {
        Self {
            name: name.to_string(),
            default: ParameterValue::Int(default),
            combinator: Combinator::Int(combine),
        }
    }

    pub fn float(name: &str, default: f64, combine: fn(f64, f64) -> f64) -> Self {
        Self {
            name: name.to_string(),
            default: ParameterValue::Float(default),
            combinator: Combinator::Float(combine),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_value(&self) -> ParameterValue {
        self.default
    }

    pub fn value_type(&self) -> ParameterType {
        self.combinator.value_type()
    }
}

/// A resolved value that has to be pushed to the hardware
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterChange {
    pub name: String,
    pub value: ParameterValue,
}

#[derive(Debug)]
struct ParameterEntry {
    spec: ParameterSpec,
    effective: ParameterValue,
    /// Last value handed to the hardware in this session
    applied: Option<ParameterValue>,
}

/// Registered parameters of one device with their resolved values
#[derive(Debug, Default)]
pub struct ParameterTable {
    entries: Vec<ParameterEntry>,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter, rejecting duplicate names
    pub fn register(&mut self, spec: ParameterSpec) -> DeviceResult<()> {
        if self.entries.iter().any(|e| e.spec.name == spec.name) {
            return Err(DeviceError::DuplicateParameter(spec.name));
        }
        self.entries.push(ParameterEntry {
            effective: spec.default,
            applied: None,
            spec,
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered specs in registration order
    pub fn specs(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.entries.iter().map(|e| &e.spec)
    }

    /// Default value of every parameter, the starting point of a new lease
    pub fn defaults(&self) -> HashMap<String, ParameterValue> {
        self.entries
            .iter()
            .map(|e| (e.spec.name.clone(), e.spec.default))
            .collect()
    }

    /// Check that `value` can be assigned to `name`
    pub fn validate(&self, name: &str, value: &ParameterValue) -> DeviceResult<()> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.spec.name == name)
            .ok_or_else(|| DeviceError::UnknownParameter(name.to_string()))?;
        if entry.spec.value_type() != value.value_type() {
            return Err(DeviceError::ParameterType {
                name: name.to_string(),
                expected: entry.spec.value_type(),
            });
        }
        Ok(())
    }

    /// Current effective value of a parameter
    pub fn effective(&self, name: &str) -> Option<ParameterValue> {
        self.entries
            .iter()
            .find(|e| e.spec.name == name)
            .map(|e| e.effective)
    }

    /// Recompute every effective value from the leases' preferences.
    ///
    /// `leases` is walked in order; with no leases the default applies.
    pub fn resolve<'a, I>(&mut self, leases: I)
    where
        I: IntoIterator<Item = &'a HashMap<String, ParameterValue>>,
        I::IntoIter: Clone,
    {
        let leases = leases.into_iter();
        for entry in &mut self.entries {
            let spec = &entry.spec;
            let folded = leases
                .clone()
                .map(|values| values.get(&spec.name).copied().unwrap_or(spec.default))
                .reduce(|acc, value| spec.combinator.combine(acc, value).unwrap_or(acc));
            entry.effective = folded.unwrap_or(spec.default);
        }
    }

    /// Effective values that differ from what the hardware last received.
    ///
    /// Marks them applied, so a failing push is not retried every time.
    pub fn take_pending(&mut self) -> Vec<ParameterChange> {
        let mut changes = Vec::new();
        for entry in &mut self.entries {
            let changed = entry
                .applied
                .is_none_or(|applied| entry.effective.differs_from(&applied));
            if changed {
                entry.applied = Some(entry.effective);
                changes.push(ParameterChange {
                    name: entry.spec.name.clone(),
                    value: entry.effective,
                });
            }
        }
        changes
    }

    /// Forget what was applied, the next session pushes everything again
    pub fn forget_applied(&mut self) {
        for entry in &mut self.entries {
            entry.applied = None;
        }
    }
}
