//! Model parameters and the free-parameter vector searched by the optimizer.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{FitError, SfError, SfResult, StatError};

/// Largest representable single-precision value, used as the default hard
/// limit so that limits survive a round trip through 32-bit calibration files.
pub const HUGE_VALUE: f64 = f32::MAX as f64;

/// A single named model parameter.
///
/// A parameter is free unless it is frozen or linked. A linked parameter
/// takes its value from the parameter it names, resolved each time the free
/// values are expanded, and must still respect its own soft limits.
///
/// Deserializing checks that the limits are ordered and nested. Whether the
/// value lies inside them is checked when a fit starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawParameter")]
pub struct Parameter {
    pub name: String,
    value: f64,
    default_value: f64,
    min: f64,
    max: f64,
    hard_min: f64,
    hard_max: f64,
    frozen: bool,
    always_frozen: bool,
    link: Option<String>,
    pub units: String,
}

#[derive(Deserialize)]
struct RawParameter {
    name: String,
    value: f64,
    default_value: Option<f64>,
    #[serde(default = "neg_huge")]
    min: f64,
    #[serde(default = "huge")]
    max: f64,
    #[serde(default = "neg_huge")]
    hard_min: f64,
    #[serde(default = "huge")]
    hard_max: f64,
    #[serde(default)]
    frozen: bool,
    #[serde(default)]
    always_frozen: bool,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    units: String,
}

fn huge() -> f64 {
    HUGE_VALUE
}

fn neg_huge() -> f64 {
    -HUGE_VALUE
}

impl TryFrom<RawParameter> for Parameter {
    type Error = SfError;

    fn try_from(raw: RawParameter) -> SfResult<Self> {
        let collapsed = |min, max| FitError::BoundsCollapsed {
            parameter: raw.name.clone(),
            min,
            max,
        };
        if !(raw.hard_min < raw.hard_max) {
            return Err(collapsed(raw.hard_min, raw.hard_max).into());
        }
        if !(raw.min < raw.max) {
            return Err(collapsed(raw.min, raw.max).into());
        }
        check_value(&raw.name, raw.min, raw.hard_min, raw.hard_max)?;
        check_value(&raw.name, raw.max, raw.hard_min, raw.hard_max)?;
        if raw.value.is_nan() {
            return Err(crate::data_error!("parameter {} has a NaN value", raw.name));
        }
        if raw.link.as_deref() == Some(raw.name.as_str()) {
            return Err(FitError::InvalidLink {
                parameter: raw.name,
                reason: "a parameter cannot link to itself".into(),
            }
            .into());
        }
        if raw.always_frozen && raw.link.is_some() {
            return Err(FitError::InvalidLink {
                parameter: raw.name,
                reason: "parameter is always frozen".into(),
            }
            .into());
        }

        Ok(Self {
            default_value: raw.default_value.unwrap_or(raw.value),
            name: raw.name,
            value: raw.value,
            min: raw.min,
            max: raw.max,
            hard_min: raw.hard_min,
            hard_max: raw.hard_max,
            frozen: raw.frozen || raw.always_frozen,
            always_frozen: raw.always_frozen,
            link: raw.link,
            units: raw.units,
        })
    }
}

impl Parameter {
    /// Create a thawed parameter with soft limits equal to the hard limits.
    pub fn new(name: impl Into<String>, value: f64) -> SfResult<Self> {
        let name = name.into();
        check_value(&name, value, -HUGE_VALUE, HUGE_VALUE)?;
        Ok(Self {
            name,
            value,
            default_value: value,
            min: -HUGE_VALUE,
            max: HUGE_VALUE,
            hard_min: -HUGE_VALUE,
            hard_max: HUGE_VALUE,
            frozen: false,
            always_frozen: false,
            link: None,
            units: String::new(),
        })
    }

    pub fn with_limits(mut self, min: f64, max: f64) -> SfResult<Self> {
        self.set_limits(min, max)?;
        Ok(self)
    }

    pub fn with_hard_limits(mut self, hard_min: f64, hard_max: f64) -> SfResult<Self> {
        if hard_min >= hard_max {
            return Err(FitError::BoundsCollapsed {
                parameter: self.name.clone(),
                min: hard_min,
                max: hard_max,
            }
            .into());
        }
        self.hard_min = hard_min;
        self.hard_max = hard_max;
        self.min = self.min.clamp(hard_min, hard_max);
        self.max = self.max.clamp(hard_min, hard_max);
        check_value(&self.name, self.value, self.min, self.max)?;
        Ok(self)
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    pub fn frozen(mut self) -> Self {
        self.frozen = true;
        self
    }

    /// Frozen for good: `thaw` and `link_to` are refused.
    pub fn always_frozen(mut self) -> Self {
        self.frozen = true;
        self.always_frozen = true;
        self
    }

    /// Set the soft limits, which must lie inside the hard limits.
    ///
    /// A current value the new range excludes is moved to the nearest new
    /// limit, with a warning.
    pub fn set_limits(&mut self, min: f64, max: f64) -> SfResult<()> {
        if !(min < max) {
            return Err(FitError::BoundsCollapsed {
                parameter: self.name.clone(),
                min,
                max,
            }
            .into());
        }
        check_value(&self.name, min, self.hard_min, self.hard_max)?;
        check_value(&self.name, max, self.hard_min, self.hard_max)?;

        self.min = min;
        self.max = max;
        let moved = self.value.clamp(min, max);
        if moved != self.value {
            warn!(
                parameter = %self.name,
                old = self.value,
                new = moved,
                "value outside new limits, reset to the nearest limit"
            );
            self.value = moved;
            self.default_value = moved;
        }
        self.default_value = self.default_value.clamp(min, max);
        Ok(())
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn default_value(&self) -> f64 {
        self.default_value
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn hard_min(&self) -> f64 {
        self.hard_min
    }

    pub fn hard_max(&self) -> f64 {
        self.hard_max
    }

    /// Set a new value, which also becomes the default restored by `reset`.
    /// Any link is dropped.
    pub fn set_value(&mut self, value: f64) -> SfResult<()> {
        check_value(&self.name, value, self.min, self.max)?;
        self.link = None;
        self.value = value;
        self.default_value = value;
        Ok(())
    }

    /// Store a fitted value without touching the default.
    pub fn set_fit_value(&mut self, value: f64) -> SfResult<()> {
        check_value(&self.name, value, self.min, self.max)?;
        self.value = value;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.value = self.default_value;
    }

    /// True when the optimizer must leave this parameter alone.
    pub fn is_frozen(&self) -> bool {
        self.frozen || self.link.is_some()
    }

    pub fn is_always_frozen(&self) -> bool {
        self.always_frozen
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn thaw(&mut self) -> Result<(), FitError> {
        if self.always_frozen {
            return Err(FitError::AlwaysFrozen {
                parameter: self.name.clone(),
            });
        }
        self.frozen = false;
        Ok(())
    }

    /// Name of the parameter this one takes its value from.
    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    /// Take this parameter's value from the parameter named `target`.
    ///
    /// The target is looked up when values are expanded, so it only has to
    /// exist in the same parameter list by then.
    pub fn link_to(&mut self, target: impl Into<String>) -> Result<(), FitError> {
        let target = target.into();
        if self.always_frozen {
            return Err(FitError::InvalidLink {
                parameter: self.name.clone(),
                reason: "parameter is always frozen".into(),
            });
        }
        if target == self.name {
            return Err(FitError::InvalidLink {
                parameter: self.name.clone(),
                reason: "a parameter cannot link to itself".into(),
            });
        }
        self.link = Some(target);
        Ok(())
    }

    pub fn unlink(&mut self) {
        self.link = None;
    }
}

fn check_value(name: &str, value: f64, min: f64, max: f64) -> Result<(), FitError> {
    // NaN fails both comparisons, so test containment positively.
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(FitError::OutOfBounds {
            parameter: name.to_string(),
            value,
            min,
            max,
        })
    }
}

/// Values of the thawed parameters, in model order, with their bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterVector {
    pub names: Vec<String>,
    pub values: Vec<f64>,
    pub bounds: Vec<(f64, f64)>,
}

impl ParameterVector {
    /// Collect the free parameters of `parameters`.
    pub fn from_parameters(parameters: &[Parameter]) -> Self {
        let free = parameters.iter().filter(|p| !p.is_frozen());
        let mut names = Vec::new();
        let mut values = Vec::new();
        let mut bounds = Vec::new();
        for p in free {
            names.push(p.name.clone());
            values.push(p.value);
            bounds.push((p.min, p.max));
        }
        Self {
            names,
            values,
            bounds,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Check that bounds are ordered and every value lies inside its bound.
    pub fn validate(&self) -> Result<(), FitError> {
        for ((name, &value), &(min, max)) in self.names.iter().zip(&self.values).zip(&self.bounds) {
            if !(min < max) {
                return Err(FitError::BoundsCollapsed {
                    parameter: name.clone(),
                    min,
                    max,
                });
            }
            check_value(name, value, min, max)?;
        }
        Ok(())
    }

    /// Clamp `values` into the bounds in place.
    pub fn clamp_into(&self, values: &mut [f64]) {
        for (v, &(min, max)) in values.iter_mut().zip(&self.bounds) {
            *v = v.clamp(min, max);
        }
    }

    /// Copy with `values` replaced.
    pub fn with_values(&self, values: Vec<f64>) -> Self {
        Self {
            names: self.names.clone(),
            values,
            bounds: self.bounds.clone(),
        }
    }
}

/// Follow the link chain starting at `start` to a parameter that holds its
/// own value.
fn link_source(parameters: &[Parameter], start: usize) -> Result<usize, FitError> {
    let invalid = |reason: String| FitError::InvalidLink {
        parameter: parameters[start].name.clone(),
        reason,
    };
    let mut current = start;
    for _ in 0..parameters.len() {
        let Some(target) = parameters[current].link.as_deref() else {
            return Ok(current);
        };
        let mut matches = parameters.iter().enumerate().filter(|(_, p)| p.name == target);
        current = match (matches.next(), matches.next()) {
            (Some((i, _)), None) => i,
            (None, _) => return Err(invalid(format!("no parameter named {target}"))),
            (Some(_), Some(_)) => return Err(invalid(format!("{target} names several parameters"))),
        };
    }
    Err(invalid("link cycle".into()))
}

/// Check that every link names a parameter in `parameters` and that no link
/// chain loops.
pub fn validate_links(parameters: &[Parameter]) -> Result<(), FitError> {
    for (i, p) in parameters.iter().enumerate() {
        if p.link.is_some() {
            link_source(parameters, i)?;
        }
    }
    Ok(())
}

/// Merge free values back into a full parameter value list.
///
/// Frozen values fill the gaps, then linked parameters copy the value they
/// resolve to. A resolved value outside the linked parameter's soft limits
/// is an error.
pub fn expand_free_values(parameters: &[Parameter], free: &[f64]) -> SfResult<Vec<f64>> {
    let n_free = parameters.iter().filter(|p| !p.is_frozen()).count();
    if free.len() != n_free {
        return Err(StatError::shape("free parameters", n_free, free.len()).into());
    }

    let mut free = free.iter();
    let mut out: Vec<f64> = parameters
        .iter()
        .map(|p| {
            if p.is_frozen() {
                p.value
            } else {
                free.next().copied().unwrap_or(p.value)
            }
        })
        .collect();

    for (i, p) in parameters.iter().enumerate() {
        if p.link.is_some() {
            let value = out[link_source(parameters, i)?];
            check_value(&p.name, value, p.min, p.max)?;
            out[i] = value;
        }
    }
    Ok(out)
}
