use crate::error::{EngineError, Result};
use crate::units::Units;
use crate::value::Value;
use rand::RngCore;
use rand_distr::Distribution as _;
use std::fmt;

/// A collection-valued [`Value`].
///
/// Realized distributions hold concrete members (spatial query results,
/// raster bands, sampled populations). The parameterized forms describe a
/// population analytically and only materialize members when sampled.
#[derive(Clone, Debug, PartialEq)]
pub enum Distribution {
    Realized { values: Vec<Value>, units: Units },
    Uniform { low: f64, high: f64, units: Units },
    Normal { mean: f64, std: f64, units: Units },
}

impl Distribution {
    pub fn realized(values: Vec<Value>, units: Units) -> Distribution {
        Distribution::Realized { values, units }
    }

    pub fn uniform(low: f64, high: f64, units: Units) -> Distribution {
        Distribution::Uniform { low, high, units }
    }

    pub fn normal(mean: f64, std: f64, units: Units) -> Distribution {
        Distribution::Normal { mean, std, units }
    }

    pub fn units(&self) -> &Units {
        match self {
            Distribution::Realized { units, .. } => units,
            Distribution::Uniform { units, .. } => units,
            Distribution::Normal { units, .. } => units,
        }
    }

    /// Concrete members, when this distribution has any.
    pub fn members(&self) -> Option<&[Value]> {
        match self {
            Distribution::Realized { values, .. } => Some(values),
            _ => None,
        }
    }

    /// Number of members as a `count` value. Parameterized populations are
    /// unbounded and cannot be counted.
    pub fn count(&self) -> Result<Value> {
        match self {
            Distribution::Realized { values, .. } => {
                Ok(Value::int(values.len() as i64, Units::count()))
            }
            _ => Err(EngineError::math("count of an unbounded distribution")),
        }
    }

    pub fn min(&self) -> Result<Value> {
        match self {
            Distribution::Realized { .. } => {
                let (numbers, all_int) = self.numeric_members()?;
                let min = fold_numbers(&numbers, f64::min)?;
                Ok(number(min, all_int, self.units()))
            }
            Distribution::Uniform { low, units, .. } => Ok(Value::decimal(*low, units.clone())),
            Distribution::Normal { .. } => Err(EngineError::math("min of a normal distribution")),
        }
    }

    pub fn max(&self) -> Result<Value> {
        match self {
            Distribution::Realized { .. } => {
                let (numbers, all_int) = self.numeric_members()?;
                let max = fold_numbers(&numbers, f64::max)?;
                Ok(number(max, all_int, self.units()))
            }
            Distribution::Uniform { high, units, .. } => Ok(Value::decimal(*high, units.clone())),
            Distribution::Normal { .. } => Err(EngineError::math("max of a normal distribution")),
        }
    }

    pub fn mean(&self) -> Result<Value> {
        match self {
            Distribution::Realized { .. } => {
                let (numbers, _) = self.numeric_members()?;
                if numbers.is_empty() {
                    return Err(EngineError::math("mean of an empty distribution"));
                }
                let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
                Ok(Value::decimal(mean, self.units().clone()))
            }
            Distribution::Uniform { low, high, units } => {
                Ok(Value::decimal((low + high) / 2.0, units.clone()))
            }
            Distribution::Normal { mean, units, .. } => Ok(Value::decimal(*mean, units.clone())),
        }
    }

    /// Population standard deviation.
    pub fn std(&self) -> Result<Value> {
        match self {
            Distribution::Realized { .. } => {
                let (numbers, _) = self.numeric_members()?;
                if numbers.is_empty() {
                    return Err(EngineError::math("std of an empty distribution"));
                }
                let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
                let variance = numbers.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>()
                    / numbers.len() as f64;
                Ok(Value::decimal(variance.sqrt(), self.units().clone()))
            }
            Distribution::Uniform { low, high, units } => {
                Ok(Value::decimal((high - low) / 12f64.sqrt(), units.clone()))
            }
            Distribution::Normal { std, units, .. } => Ok(Value::decimal(*std, units.clone())),
        }
    }

    pub fn sum(&self) -> Result<Value> {
        match self {
            Distribution::Realized { .. } => {
                let (numbers, all_int) = self.numeric_members()?;
                Ok(number(numbers.iter().sum::<f64>(), all_int, self.units()))
            }
            _ => Err(EngineError::math("sum of an unbounded distribution")),
        }
    }

    /// Draws `n` members. Sampling without replacement requires a realized
    /// population at least `n` large; parameterized populations draw
    /// independently regardless of the flag.
    pub fn sample_n(
        &self,
        rng: &mut dyn RngCore,
        n: usize,
        with_replacement: bool,
    ) -> Result<Vec<Value>> {
        match self {
            Distribution::Realized { values, .. } => {
                if with_replacement {
                    if values.is_empty() {
                        return Err(EngineError::math("sample from an empty distribution"));
                    }
                    let mut out = Vec::with_capacity(n);
                    for _ in 0..n {
                        let i = (rng.next_u64() % values.len() as u64) as usize;
                        out.push(values[i].clone());
                    }
                    Ok(out)
                } else {
                    if n > values.len() {
                        return Err(EngineError::math(format!(
                            "cannot draw {} members from a population of {} without replacement",
                            n,
                            values.len()
                        )));
                    }
                    let picked = rand::seq::index::sample(&mut ErasedRng(rng), values.len(), n);
                    Ok(picked.iter().map(|i| values[i].clone()).collect())
                }
            }
            Distribution::Uniform { low, high, units } => {
                let mut out = Vec::with_capacity(n);
                let mut rng = ErasedRng(rng);
                for _ in 0..n {
                    let t = rand::Rng::gen::<f64>(&mut rng);
                    out.push(Value::decimal(low + t * (high - low), units.clone()));
                }
                Ok(out)
            }
            Distribution::Normal { mean, std, units } => {
                let dist = rand_distr::Normal::new(*mean, *std)
                    .map_err(|_| EngineError::math("normal distribution with negative stdev"))?;
                let mut out = Vec::with_capacity(n);
                let mut rng = ErasedRng(rng);
                for _ in 0..n {
                    out.push(Value::decimal(dist.sample(&mut rng), units.clone()));
                }
                Ok(out)
            }
        }
    }

    /// Deep-freezes every member; the shape of the distribution is already
    /// immutable.
    pub fn freeze(&self) -> Distribution {
        match self {
            Distribution::Realized { values, units } => Distribution::Realized {
                values: values.iter().map(Value::freeze).collect(),
                units: units.clone(),
            },
            other => other.clone(),
        }
    }

    fn numeric_members(&self) -> Result<(Vec<f64>, bool)> {
        let values = match self.members() {
            Some(values) => values,
            None => return Err(EngineError::math("aggregate of an unbounded distribution")),
        };
        let mut numbers = Vec::with_capacity(values.len());
        let mut all_int = true;
        for value in values {
            match value {
                Value::Int(i, _) => numbers.push(*i as f64),
                Value::Decimal(d, _) => {
                    all_int = false;
                    numbers.push(*d);
                }
                other => {
                    return Err(EngineError::type_mismatch("number", other.kind()));
                }
            }
        }
        Ok((numbers, all_int))
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Distribution::Realized { values, units } => {
                write!(f, "distribution(n={}, units={})", values.len(), units)
            }
            Distribution::Uniform { low, high, units } => {
                write!(f, "uniform({}, {}) {}", low, high, units)
            }
            Distribution::Normal { mean, std, units } => {
                write!(f, "normal({}, {}) {}", mean, std, units)
            }
        }
    }
}

fn fold_numbers(numbers: &[f64], f: fn(f64, f64) -> f64) -> Result<f64> {
    let mut iter = numbers.iter();
    let first = iter
        .next()
        .ok_or_else(|| EngineError::math("aggregate of an empty distribution"))?;
    Ok(iter.fold(*first, |acc, x| f(acc, *x)))
}

fn number(x: f64, prefer_int: bool, units: &Units) -> Value {
    if prefer_int && x.fract() == 0.0 {
        Value::int(x as i64, units.clone())
    } else {
        Value::decimal(x, units.clone())
    }
}

/// Adapter so `&mut dyn RngCore` satisfies the sized `Rng` bounds of the
/// rand sampling helpers.
struct ErasedRng<'a>(&'a mut dyn RngCore);

impl<'a> RngCore for ErasedRng<'a> {
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.0.try_fill_bytes(dest)
    }
}
