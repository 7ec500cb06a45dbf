use crate::error::{EngineError, Result};
use fxhash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// Interned units tag attached to every numeric value.
///
/// Equality is name equality; whether two differently-named units are
/// convertible is the business of the [`UnitConverter`], not of `Units`
/// itself. The empty tag acts as a wildcard that combines with anything.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Units(Arc<str>);

impl Units {
    pub fn of(name: &str) -> Units {
        Units(Arc::from(name.trim()))
    }

    pub fn empty() -> Units {
        Units(Arc::from(""))
    }

    pub fn count() -> Units {
        Units(Arc::from("count"))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Units of a product. The empty tag is absorbed by the other operand.
    pub fn multiply(&self, other: &Units) -> Units {
        if self.is_empty() {
            other.clone()
        } else if other.is_empty() {
            self.clone()
        } else {
            Units::of(&format!("{}*{}", self.0, other.0))
        }
    }

    /// Units of a quotient. Dividing a tag by itself cancels to empty.
    pub fn divide(&self, other: &Units) -> Units {
        if other.is_empty() {
            self.clone()
        } else if self == other {
            Units::empty()
        } else {
            Units::of(&format!("{}/{}", self.0, other.0))
        }
    }

    /// Whether two tags may meet in add/subtract/compare without casting.
    pub fn combines_with(&self, other: &Units) -> bool {
        self.is_empty() || other.is_empty() || self == other
    }

    /// The non-empty tag of the pair, used to stamp the result of an
    /// operation over compatible operands.
    pub fn dominant(&self, other: &Units) -> Units {
        if self.is_empty() {
            other.clone()
        } else {
            self.clone()
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Units {
    fn default() -> Units {
        Units::empty()
    }
}

/// A compiled conversion between two unit tags.
#[derive(Clone)]
pub enum Conversion {
    /// The destination is just another spelling of the source.
    Noop { alias: Units },
    /// Affine conversion applied to the numeric payload.
    Scale { factor: f64, offset: f64 },
    /// Arbitrary callable for conversions a scale cannot express.
    Callable(Arc<dyn Fn(f64) -> Result<f64> + Send + Sync>),
}

impl Conversion {
    pub fn apply(&self, value: f64) -> Result<f64> {
        match self {
            Conversion::Noop { .. } => Ok(value),
            Conversion::Scale { factor, offset } => Ok(value * factor + offset),
            Conversion::Callable(f) => f(value),
        }
    }
}

impl fmt::Debug for Conversion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Conversion::Noop { alias } => write!(f, "Noop({})", alias),
            Conversion::Scale { factor, offset } => write!(f, "Scale({}, {})", factor, offset),
            Conversion::Callable(_) => write!(f, "Callable"),
        }
    }
}

/// Registry mapping (source, destination) unit pairs to compiled
/// conversions, plus an alias table used to normalize spellings before
/// lookup. One converter instance is owned per simulation.
pub struct UnitConverter {
    conversions: FxHashMap<(Units, Units), Conversion>,
    aliases: FxHashMap<String, Units>,
}

impl UnitConverter {
    pub fn new() -> UnitConverter {
        UnitConverter {
            conversions: FxHashMap::default(),
            aliases: FxHashMap::default(),
        }
    }

    /// A converter preloaded with the conversions simulations reach for
    /// constantly. Everything else is registered by the surface layer.
    pub fn with_defaults() -> UnitConverter {
        let mut converter = UnitConverter::new();
        converter.register_alias("meters", Units::of("m"));
        converter.register_alias("meter", Units::of("m"));
        converter.register_alias("kilometers", Units::of("km"));
        converter.register_alias("grams", Units::of("g"));
        converter.register_alias("kilograms", Units::of("kg"));
        converter.register_alias("counts", Units::count());
        converter.register_scale(Units::of("g"), Units::of("kg"), 1e-3, 0.0);
        converter.register_scale(Units::of("kg"), Units::of("g"), 1e3, 0.0);
        converter.register_scale(Units::of("m"), Units::of("km"), 1e-3, 0.0);
        converter.register_scale(Units::of("km"), Units::of("m"), 1e3, 0.0);
        converter.register_scale(Units::of("C"), Units::of("K"), 1.0, 273.15);
        converter.register_scale(Units::of("K"), Units::of("C"), 1.0, -273.15);
        converter
    }

    pub fn register(&mut self, from: Units, to: Units, conversion: Conversion) {
        self.conversions.insert((from, to), conversion);
    }

    pub fn register_scale(&mut self, from: Units, to: Units, factor: f64, offset: f64) {
        self.register(from, to, Conversion::Scale { factor, offset });
    }

    /// Registers `spelling` as an alternate name for `canonical`, and a noop
    /// conversion in both directions so explicit casts succeed too.
    pub fn register_alias(&mut self, spelling: &str, canonical: Units) {
        let alias = Units::of(spelling);
        self.aliases.insert(spelling.to_string(), canonical.clone());
        self.conversions.insert(
            (alias.clone(), canonical.clone()),
            Conversion::Noop {
                alias: canonical.clone(),
            },
        );
        self.conversions
            .insert((canonical, alias.clone()), Conversion::Noop { alias });
    }

    /// Canonical form of a tag, after alias substitution.
    pub fn normalize(&self, units: &Units) -> Units {
        match self.aliases.get(units.name()) {
            Some(canonical) => canonical.clone(),
            None => units.clone(),
        }
    }

    pub fn lookup(&self, from: &Units, to: &Units) -> Option<&Conversion> {
        self.conversions.get(&(from.clone(), to.clone()))
    }

    /// Converts a numeric payload from one tag to another.
    ///
    /// With `force` set, an unknown pair restamps the payload unchanged
    /// instead of failing; a known pair still converts.
    pub fn convert(&self, value: f64, from: &Units, to: &Units, force: bool) -> Result<f64> {
        let from = self.normalize(from);
        let to = self.normalize(to);
        if from == to || from.is_empty() {
            return Ok(value);
        }
        match self.lookup(&from, &to) {
            Some(conversion) => conversion.apply(value),
            None if force => Ok(value),
            None => Err(EngineError::Unit {
                left: from.name().to_string(),
                right: to.name().to_string(),
            }),
        }
    }
}

impl Default for UnitConverter {
    fn default() -> UnitConverter {
        UnitConverter::with_defaults()
    }
}
