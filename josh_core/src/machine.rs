use crate::distribution::Distribution;
use crate::entity::MutableEntity;
use crate::error::{EngineError, Result};
use crate::units::{UnitConverter, Units};
use crate::value::Value;
use fxhash::FxHashMap;
use rand::{Rng, RngCore};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Everything a running handler may touch beyond its own stack.
///
/// The orchestrator binds one context per locked entity; the seams for
/// spatial queries, entity creation, and external resources are provided
/// by the replicate layer and default to errors in contexts that do not
/// support them (e.g. selector-only evaluation in tests).
pub trait MachineContext {
    /// The entity this machine is bound to. Its substep lock is held by
    /// the current thread for the whole handler invocation.
    fn entity(&self) -> &Arc<MutableEntity>;

    fn converter(&self) -> &UnitConverter;

    fn rng(&mut self) -> &mut dyn RngCore;

    /// Current-else-prior attribute read on the bound entity. A slot with
    /// no value resolves to an error, not a default.
    fn read_attribute(&self, name: &str) -> Result<Value> {
        self.entity()
            .get_attribute(name)?
            .ok_or_else(|| EngineError::resolution(name))
    }

    /// Prior-substep read on the bound entity.
    fn read_prior(&self, name: &str) -> Result<Value> {
        self.entity()
            .get_prior(name)?
            .ok_or_else(|| EngineError::resolution(format!("prior.{}", name)))
    }

    /// Entities of type `target` whose geometry intersects a probe of the
    /// given radius around the bound entity.
    fn neighbors(&mut self, target: &str, distance: &Value) -> Result<Distribution> {
        let _ = (target, distance);
        Err(EngineError::program(
            "spatial queries are not available in this context",
        ))
    }

    /// Queues `count` fresh entities of type `name` at the bound entity's
    /// location.
    fn spawn(&mut self, name: &str, count: i64) -> Result<()> {
        let _ = (name, count);
        Err(EngineError::program(
            "entity creation is not available in this context",
        ))
    }

    /// Reads an external resource clipped to the bound entity's geometry.
    fn read_external(&mut self, source: &str) -> Result<Distribution> {
        let _ = source;
        Err(EngineError::program(
            "external resources are not available in this context",
        ))
    }
}

/// Callback resolving a value against the machine context at execution
/// time. Compiled actions hold these for attribute and prior references.
pub type ValueResolver = Arc<dyn Fn(&mut dyn MachineContext) -> Result<Value> + Send + Sync>;

pub mod resolvers {
    use super::*;

    pub fn constant(value: Value) -> ValueResolver {
        Arc::new(move |_| Ok(value.clone()))
    }

    pub fn attribute(name: &str) -> ValueResolver {
        let name = name.to_string();
        Arc::new(move |ctx| ctx.read_attribute(&name))
    }

    pub fn prior(name: &str) -> ValueResolver {
        let name = name.to_string();
        Arc::new(move |ctx| ctx.read_prior(&name))
    }
}

/// Push-down stack machine evaluating one compiled handler against one
/// locked entity. Single-owner and not thread-safe; the orchestrator
/// builds a fresh machine per invocation.
///
/// `end` marks the machine finished: every subsequent operation becomes a
/// no-op, which is how compiled actions express conditional early return.
pub struct EventMachine<'a> {
    ctx: &'a mut dyn MachineContext,
    stack: Vec<Value>,
    locals: FxHashMap<String, Value>,
    ended: bool,
}

impl<'a> EventMachine<'a> {
    pub fn new(ctx: &'a mut dyn MachineContext) -> EventMachine<'a> {
        EventMachine {
            ctx,
            stack: Vec::with_capacity(8),
            locals: FxHashMap::default(),
            ended: false,
        }
    }

    pub fn context(&mut self) -> &mut dyn MachineContext {
        &mut *self.ctx
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Marks the machine finished; later operations are skipped.
    pub fn end(&mut self) {
        self.ended = true;
    }

    pub fn push(&mut self, value: Value) {
        if !self.ended {
            self.stack.push(value);
        }
    }

    pub fn push_resolved(&mut self, resolver: &ValueResolver) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let value = resolver(self.ctx)?;
        self.stack.push(value);
        Ok(())
    }

    pub fn push_attribute(&mut self, name: &str) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let value = self.ctx.read_attribute(name)?;
        self.stack.push(value);
        Ok(())
    }

    pub fn push_prior(&mut self, name: &str) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let value = self.ctx.read_prior(name)?;
        self.stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| EngineError::program("pop from an empty stack"))
    }

    /// Terminal value of the evaluation: the top of the stack.
    pub fn result(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| EngineError::program("handler finished with an empty stack"))
    }

    pub fn save_local(&mut self, name: &str) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let value = self.pop()?;
        self.locals.insert(name.to_string(), value);
        Ok(())
    }

    pub fn push_local(&mut self, name: &str) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let value = self
            .locals
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::resolution(name))?;
        self.stack.push(value);
        Ok(())
    }

    fn binary(&mut self, op: fn(&Value, &Value) -> Result<Value>) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let right = self.pop()?;
        let left = self.pop()?;
        self.stack.push(op(&left, &right)?);
        Ok(())
    }

    pub fn add(&mut self) -> Result<()> {
        self.binary(Value::add)
    }

    pub fn subtract(&mut self) -> Result<()> {
        self.binary(Value::subtract)
    }

    pub fn multiply(&mut self) -> Result<()> {
        self.binary(Value::multiply)
    }

    pub fn divide(&mut self) -> Result<()> {
        self.binary(Value::divide)
    }

    pub fn pow(&mut self) -> Result<()> {
        self.binary(Value::pow)
    }

    fn unary(&mut self, op: fn(&Value) -> Result<Value>) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let operand = self.pop()?;
        self.stack.push(op(&operand)?);
        Ok(())
    }

    pub fn abs(&mut self) -> Result<()> {
        self.unary(Value::abs)
    }

    pub fn ceil(&mut self) -> Result<()> {
        self.unary(Value::ceil)
    }

    pub fn floor(&mut self) -> Result<()> {
        self.unary(Value::floor)
    }

    pub fn round(&mut self) -> Result<()> {
        self.unary(Value::round)
    }

    pub fn log10(&mut self) -> Result<()> {
        self.unary(Value::log10)
    }

    pub fn ln(&mut self) -> Result<()> {
        self.unary(Value::ln)
    }

    pub fn sqrt(&mut self) -> Result<()> {
        self.unary(Value::sqrt)
    }

    fn comparison(&mut self, accept: fn(Ordering) -> bool) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let right = self.pop()?;
        let left = self.pop()?;
        let ordering = left.compare(&right)?;
        self.stack.push(Value::bool(accept(ordering)));
        Ok(())
    }

    pub fn gt(&mut self) -> Result<()> {
        self.comparison(|o| o == Ordering::Greater)
    }

    pub fn gte(&mut self) -> Result<()> {
        self.comparison(|o| o != Ordering::Less)
    }

    pub fn lt(&mut self) -> Result<()> {
        self.comparison(|o| o == Ordering::Less)
    }

    pub fn lte(&mut self) -> Result<()> {
        self.comparison(|o| o != Ordering::Greater)
    }

    pub fn eq(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let right = self.pop()?;
        let left = self.pop()?;
        self.stack.push(Value::bool(left == right));
        Ok(())
    }

    pub fn neq(&mut self) -> Result<()> {
        self.eq()?;
        if !self.ended {
            let flipped = !self.pop()?.as_bool()?;
            self.stack.push(Value::bool(flipped));
        }
        Ok(())
    }

    pub fn and(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let right = self.pop()?.as_bool()?;
        let left = self.pop()?.as_bool()?;
        self.stack.push(Value::bool(left && right));
        Ok(())
    }

    pub fn or(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let right = self.pop()?.as_bool()?;
        let left = self.pop()?.as_bool()?;
        self.stack.push(Value::bool(left || right));
        Ok(())
    }

    pub fn not(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let operand = self.pop()?.as_bool()?;
        self.stack.push(Value::bool(!operand));
        Ok(())
    }

    fn aggregate(&mut self, op: fn(&Distribution) -> Result<Value>) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let operand = self.pop()?;
        let aggregated = op(operand.as_distribution()?)?;
        self.stack.push(aggregated);
        Ok(())
    }

    pub fn count(&mut self) -> Result<()> {
        self.aggregate(Distribution::count)
    }

    pub fn max(&mut self) -> Result<()> {
        self.aggregate(Distribution::max)
    }

    pub fn min(&mut self) -> Result<()> {
        self.aggregate(Distribution::min)
    }

    pub fn mean(&mut self) -> Result<()> {
        self.aggregate(Distribution::mean)
    }

    pub fn std(&mut self) -> Result<()> {
        self.aggregate(Distribution::std)
    }

    pub fn sum(&mut self) -> Result<()> {
        self.aggregate(Distribution::sum)
    }

    /// Clamps the operand. The stack holds `operand [lower] [upper]` with
    /// the bounds on top.
    pub fn bound(&mut self, has_min: bool, has_max: bool) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let upper = if has_max { Some(self.pop()?) } else { None };
        let lower = if has_min { Some(self.pop()?) } else { None };
        let mut operand = self.pop()?;
        if let Some(lower) = lower {
            if operand.compare(&lower)? == Ordering::Less {
                operand = lower;
            }
        }
        if let Some(upper) = upper {
            if operand.compare(&upper)? == Ordering::Greater {
                operand = upper;
            }
        }
        self.stack.push(operand);
        Ok(())
    }

    /// Maps the operand from one range onto another.
    ///
    /// The stack holds `operand from_low from_high to_low to_high`, plus a
    /// trailing shape argument for the `parametric` method. Unknown method
    /// names are a program error.
    pub fn apply_map(&mut self, method: &str) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let shape = if method == "parametric" {
            Some(self.pop()?.as_f64()?)
        } else {
            None
        };
        let to_high = self.pop()?;
        let to_low = self.pop()?;
        let from_high = self.pop()?.as_f64()?;
        let from_low = self.pop()?.as_f64()?;
        let operand = self.pop()?.as_f64()?;

        let span = from_high - from_low;
        if span == 0.0 {
            return Err(EngineError::math("map with an empty source range"));
        }
        let t = (operand - from_low) / span;
        let shaped = match method {
            "linear" => t,
            "quadratic" => t * t,
            "sigmoid" => 1.0 / (1.0 + (-10.0 * (t - 0.5)).exp()),
            "parametric" => {
                // Popped above; shape is always present on this path.
                let exponent = shape.unwrap_or(1.0);
                t.powf(exponent)
            }
            other => {
                return Err(EngineError::program(format!("unknown map method `{}`", other)));
            }
        };

        let low = to_low.as_f64()?;
        let high = to_high.as_f64()?;
        let units = to_low.units().dominant(&to_high.units());
        self.stack
            .push(Value::decimal(low + shaped * (high - low), units));
        Ok(())
    }

    /// Draws from the distribution under the count on the stack and pushes
    /// a realized distribution of the samples.
    pub fn sample(&mut self, with_replacement: bool) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let count = self.pop()?.as_int()?;
        if count < 0 {
            return Err(EngineError::math("sample with a negative count"));
        }
        let target = self.pop()?;
        let distribution = target.as_distribution()?;
        let drawn =
            distribution.sample_n(self.ctx.rng(), count as usize, with_replacement)?;
        let units = distribution.units().clone();
        self.stack
            .push(Value::distribution(Distribution::realized(drawn, units)));
        Ok(())
    }

    pub fn rand_uniform(&mut self, low: &Value, high: &Value) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let units = low.units().dominant(&high.units());
        let low = low.as_f64()?;
        let high = high.as_f64()?;
        let t: f64 = self.ctx.rng().gen();
        self.stack
            .push(Value::decimal(low + t * (high - low), units));
        Ok(())
    }

    pub fn rand_norm(&mut self, mean: &Value, std: &Value) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let units = mean.units().dominant(&std.units());
        let sampled = Distribution::normal(mean.as_f64()?, std.as_f64()?, units.clone())
            .sample_n(self.ctx.rng(), 1, true)?;
        // sample_n(n=1) always yields exactly one member.
        self.stack.push(
            sampled
                .into_iter()
                .next()
                .unwrap_or_else(|| Value::decimal(0.0, units)),
        );
        Ok(())
    }

    pub fn cast(&mut self, to: &Units, force: bool) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let operand = self.pop()?;
        let cast = operand.cast(to, self.ctx.converter(), force)?;
        self.stack.push(cast);
        Ok(())
    }

    /// String concatenation; numeric operands are rendered through their
    /// display form.
    pub fn concat(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let right = self.pop()?;
        let left = self.pop()?;
        match (&left, &right) {
            (Value::Distribution(_), _) | (_, Value::Distribution(_)) => {
                Err(EngineError::type_mismatch("string", "distribution"))
            }
            _ => {
                self.stack
                    .push(Value::string(&format!("{}{}", left, right)));
                Ok(())
            }
        }
    }

    /// Queues new entities of the named type at the bound entity's
    /// location; the count is popped from the stack.
    pub fn create_entity(&mut self, name: &str) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let count = self.pop()?.as_int()?;
        if count < 0 {
            return Err(EngineError::math("create with a negative count"));
        }
        self.ctx.spawn(name, count)
    }

    /// Pops the query distance and pushes the distribution of intersecting
    /// entities of the target type.
    pub fn execute_spatial_query(&mut self, target: &str) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let distance = self.pop()?;
        let found = self.ctx.neighbors(target, &distance)?;
        self.stack.push(Value::distribution(found));
        Ok(())
    }

    pub fn read_external(&mut self, source: &str) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let found = self.ctx.read_external(source)?;
        self.stack.push(Value::distribution(found));
        Ok(())
    }

    /// Logs the top of the stack without disturbing it.
    pub fn debug(&mut self, label: &str) {
        match self.stack.last() {
            Some(value) => debug!(label, value = %value, "machine debug"),
            None => debug!(label, "machine debug: empty stack"),
        }
    }
}
