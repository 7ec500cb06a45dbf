use crate::distribution::Distribution;
use crate::entity::{FrozenEntity, MutableEntity};
use crate::error::{EngineError, Result};
use crate::units::{UnitConverter, Units};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Reference to another entity held inside an attribute value.
///
/// Live references point at a mutable entity cell and freeze into read-only
/// snapshots; two live references are equal only when they point at the
/// same cell.
#[derive(Clone)]
pub enum EntityRef {
    Live(Arc<MutableEntity>),
    Frozen(Arc<FrozenEntity>),
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &EntityRef) -> bool {
        match (self, other) {
            (EntityRef::Live(a), EntityRef::Live(b)) => Arc::ptr_eq(a, b),
            (EntityRef::Frozen(a), EntityRef::Frozen(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EntityRef::Live(e) => write!(f, "Live({})", e.display_name()),
            EntityRef::Frozen(e) => write!(f, "Frozen({})", e.display_name()),
        }
    }
}

/// Tagged scalar carried by every entity attribute.
///
/// Numeric variants carry a [`Units`] tag; add/subtract/compare enforce tag
/// compatibility while multiply/divide compose tags. Decimals are IEEE-754
/// doubles.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Decimal(f64, Units),
    Int(i64, Units),
    Bool(bool),
    Str(Arc<str>),
    Distribution(Distribution),
    Entity(EntityRef),
}

impl Value {
    pub fn decimal(x: f64, units: Units) -> Value {
        Value::Decimal(x, units)
    }

    pub fn int(x: i64, units: Units) -> Value {
        Value::Int(x, units)
    }

    pub fn bool(x: bool) -> Value {
        Value::Bool(x)
    }

    pub fn string(x: &str) -> Value {
        Value::Str(Arc::from(x))
    }

    pub fn distribution(x: Distribution) -> Value {
        Value::Distribution(x)
    }

    pub fn entity(x: Arc<MutableEntity>) -> Value {
        Value::Entity(EntityRef::Live(x))
    }

    pub fn frozen_entity(x: Arc<FrozenEntity>) -> Value {
        Value::Entity(EntityRef::Frozen(x))
    }

    /// Value-factory entry point for numeric literals from the surface
    /// layer. Text without a fractional part becomes an integer.
    pub fn parse_number(text: &str, units: Units) -> Result<Value> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(EngineError::Parse {
                text: text.to_string(),
            });
        }
        if !trimmed.contains('.') && !trimmed.contains('e') && !trimmed.contains('E') {
            if let Ok(i) = trimmed.parse::<i64>() {
                return Ok(Value::Int(i, units));
            }
        }
        trimmed
            .parse::<f64>()
            .map(|d| Value::Decimal(d, units))
            .map_err(|_| EngineError::Parse {
                text: text.to_string(),
            })
    }

    /// Short variant name for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Decimal(..) => "decimal",
            Value::Int(..) => "int",
            Value::Bool(..) => "bool",
            Value::Str(..) => "string",
            Value::Distribution(..) => "distribution",
            Value::Entity(..) => "entity",
        }
    }

    pub fn units(&self) -> Units {
        match self {
            Value::Decimal(_, u) | Value::Int(_, u) => u.clone(),
            Value::Distribution(d) => d.units().clone(),
            _ => Units::empty(),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Decimal(x, _) => Ok(*x),
            Value::Int(x, _) => Ok(*x as f64),
            other => Err(EngineError::type_mismatch("number", other.kind())),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(x, _) => Ok(*x),
            Value::Decimal(x, _) if x.fract() == 0.0 => Ok(*x as i64),
            other => Err(EngineError::type_mismatch("int", other.kind())),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(x) => Ok(*x),
            other => Err(EngineError::type_mismatch("bool", other.kind())),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(x) => Ok(x),
            other => Err(EngineError::type_mismatch("string", other.kind())),
        }
    }

    pub fn as_distribution(&self) -> Result<&Distribution> {
        match self {
            Value::Distribution(x) => Ok(x),
            other => Err(EngineError::type_mismatch("distribution", other.kind())),
        }
    }

    fn both_int(&self, other: &Value) -> bool {
        matches!(self, Value::Int(..)) && matches!(other, Value::Int(..))
    }

    fn combined_units(&self, other: &Value) -> Result<Units> {
        let left = self.units();
        let right = other.units();
        if !left.combines_with(&right) {
            return Err(EngineError::Unit {
                left: left.name().to_string(),
                right: right.name().to_string(),
            });
        }
        Ok(left.dominant(&right))
    }

    pub fn add(&self, other: &Value) -> Result<Value> {
        let units = self.combined_units(other)?;
        if self.both_int(other) {
            Ok(Value::Int(self.as_int()? + other.as_int()?, units))
        } else {
            Ok(Value::Decimal(self.as_f64()? + other.as_f64()?, units))
        }
    }

    pub fn subtract(&self, other: &Value) -> Result<Value> {
        let units = self.combined_units(other)?;
        if self.both_int(other) {
            Ok(Value::Int(self.as_int()? - other.as_int()?, units))
        } else {
            Ok(Value::Decimal(self.as_f64()? - other.as_f64()?, units))
        }
    }

    pub fn multiply(&self, other: &Value) -> Result<Value> {
        let units = self.units().multiply(&other.units());
        if self.both_int(other) {
            Ok(Value::Int(self.as_int()? * other.as_int()?, units))
        } else {
            Ok(Value::Decimal(self.as_f64()? * other.as_f64()?, units))
        }
    }

    pub fn divide(&self, other: &Value) -> Result<Value> {
        let divisor = other.as_f64()?;
        if divisor == 0.0 {
            return Err(EngineError::math("division by zero"));
        }
        let units = self.units().divide(&other.units());
        Ok(Value::Decimal(self.as_f64()? / divisor, units))
    }

    /// Raises to a power. The exponent must be unitless; the base tag is
    /// carried through unchanged.
    pub fn pow(&self, exponent: &Value) -> Result<Value> {
        if !exponent.units().is_empty() && exponent.units() != Units::count() {
            return Err(EngineError::Unit {
                left: self.units().name().to_string(),
                right: exponent.units().name().to_string(),
            });
        }
        let base = self.as_f64()?;
        let exp = exponent.as_f64()?;
        if self.both_int(exponent) && exp >= 0.0 {
            let mut out: i64 = 1;
            for _ in 0..exponent.as_int()? {
                out = out.saturating_mul(self.as_int()?);
            }
            Ok(Value::Int(out, self.units()))
        } else {
            Ok(Value::Decimal(base.powf(exp), self.units()))
        }
    }

    pub fn neg(&self) -> Result<Value> {
        match self {
            Value::Decimal(x, u) => Ok(Value::Decimal(-x, u.clone())),
            Value::Int(x, u) => Ok(Value::Int(-x, u.clone())),
            other => Err(EngineError::type_mismatch("number", other.kind())),
        }
    }

    /// Total order over comparable values; numbers compare after a unit
    /// compatibility check, strings lexically, booleans false-before-true.
    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                a.combined_units(b)?;
                let left = a.as_f64()?;
                let right = b.as_f64()?;
                left.partial_cmp(&right)
                    .ok_or_else(|| EngineError::math("comparison with NaN"))
            }
            (a, b) => Err(EngineError::type_mismatch(a.kind(), b.kind())),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Decimal(..) | Value::Int(..))
    }

    pub fn abs(&self) -> Result<Value> {
        match self {
            Value::Decimal(x, u) => Ok(Value::Decimal(x.abs(), u.clone())),
            Value::Int(x, u) => Ok(Value::Int(x.abs(), u.clone())),
            other => Err(EngineError::type_mismatch("number", other.kind())),
        }
    }

    pub fn ceil(&self) -> Result<Value> {
        self.map_decimal(f64::ceil)
    }

    pub fn floor(&self) -> Result<Value> {
        self.map_decimal(f64::floor)
    }

    pub fn round(&self) -> Result<Value> {
        self.map_decimal(f64::round)
    }

    pub fn log10(&self) -> Result<Value> {
        let x = self.as_f64()?;
        if x <= 0.0 {
            return Err(EngineError::math("log10 of a non-positive number"));
        }
        Ok(Value::Decimal(x.log10(), self.units()))
    }

    pub fn ln(&self) -> Result<Value> {
        let x = self.as_f64()?;
        if x <= 0.0 {
            return Err(EngineError::math("ln of a non-positive number"));
        }
        Ok(Value::Decimal(x.ln(), self.units()))
    }

    pub fn sqrt(&self) -> Result<Value> {
        let x = self.as_f64()?;
        if x < 0.0 {
            return Err(EngineError::math("sqrt of a negative number"));
        }
        Ok(Value::Decimal(x.sqrt(), self.units()))
    }

    fn map_decimal(&self, f: fn(f64) -> f64) -> Result<Value> {
        match self {
            Value::Decimal(x, u) => Ok(Value::Decimal(f(*x), u.clone())),
            Value::Int(x, u) => Ok(Value::Int(*x, u.clone())),
            other => Err(EngineError::type_mismatch("number", other.kind())),
        }
    }

    /// Converts to the destination units through the converter registry.
    ///
    /// A noop conversion keeps an integer an integer; anything that touches
    /// the payload produces a decimal. Distributions cast member-wise.
    pub fn cast(&self, to: &Units, converter: &UnitConverter, force: bool) -> Result<Value> {
        match self {
            Value::Int(x, from) => {
                let converted = converter.convert(*x as f64, from, to, force)?;
                if converted == *x as f64 {
                    Ok(Value::Int(*x, to.clone()))
                } else {
                    Ok(Value::Decimal(converted, to.clone()))
                }
            }
            Value::Decimal(x, from) => Ok(Value::Decimal(
                converter.convert(*x, from, to, force)?,
                to.clone(),
            )),
            Value::Distribution(d) => match d {
                Distribution::Realized { values, .. } => {
                    let cast = values
                        .iter()
                        .map(|v| v.cast(to, converter, force))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Value::Distribution(Distribution::realized(
                        cast,
                        to.clone(),
                    )))
                }
                _ => Err(EngineError::type_mismatch(
                    "realized distribution",
                    "parameterized distribution",
                )),
            },
            other => Err(EngineError::type_mismatch("number", other.kind())),
        }
    }

    /// Returns an immutable equivalent. Scalars are already immutable;
    /// distributions freeze member-wise and live entity references collapse
    /// to read-only snapshots. Idempotent.
    pub fn freeze(&self) -> Value {
        match self {
            Value::Distribution(d) => Value::Distribution(d.freeze()),
            Value::Entity(EntityRef::Live(e)) => Value::Entity(EntityRef::Frozen(e.snapshot())),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Decimal(x, u) if u.is_empty() => write!(f, "{}", x),
            Value::Decimal(x, u) => write!(f, "{} {}", x, u),
            Value::Int(x, u) if u.is_empty() => write!(f, "{}", x),
            Value::Int(x, u) => write!(f, "{} {}", x, u),
            Value::Bool(x) => write!(f, "{}", x),
            Value::Str(x) => write!(f, "{}", x),
            Value::Distribution(x) => write!(f, "{}", x),
            Value::Entity(EntityRef::Live(e)) => write!(f, "{}", e.display_name()),
            Value::Entity(EntityRef::Frozen(e)) => write!(f, "{}", e.display_name()),
        }
    }
}
