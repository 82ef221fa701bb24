//! Physical quantities tagged with a unit from a fixed family.
//!
//! A [`UnitNumber`] is an immutable value plus an optional unit tag. The
//! units it may carry, and the multiplicative factor between every ordered
//! pair of them, come from a [`UnitFamily`] supplied at construction. The
//! closed set of families the fraction collector needs is exposed through
//! [`Quantity`]:
//!
//! | Quantity  | Units                                         | Canonical |
//! |-----------|-----------------------------------------------|-----------|
//! | FlowRate  | uL/sec uL/min uL/hr mL/sec mL/min mL/hr        | uL/sec    |
//! | Time      | ms sec min hr                                 | sec       |
//! | Volume    | uL mL L                                       | uL        |
//! | TubeSize  | 0.5 mL, 1.0 mL, 1.5 mL                        | -         |
//! | Count     | (none)                                        | (none)    |
//!
//! Factors are declared pairwise rather than derived from a base unit, so
//! any arithmetic on quantities must first bring them to the canonical unit
//! of their family (see [`calculate`]).
//!
//! # Example
//!
//! ```
//! use colosseum::units::UnitNumber;
//!
//! let rate = UnitNumber::flow_rate(1.5, "mL/min")?;
//! let per_sec = rate.convert(Some("uL/sec"))?;
//! assert!((per_sec.value() - 25.0).abs() < 1e-9);
//! # Ok::<(), colosseum::error::UnitError>(())
//! ```

pub mod calculate;

use crate::error::{UnitError, UnitResult};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use self::Conversion::Factor as F;

/// How one unit of a family maps onto another.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Conversion {
    /// Multiply the value by this factor.
    Factor(f64),
    /// The pair is declared but has no physical conversion (tube sizes).
    Incompatible,
}

/// The set of units a quantity may carry and the conversions between them.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFamily {
    name: String,
    units: Vec<String>,
    conversions: HashMap<(String, String), Conversion>,
}

impl UnitFamily {
    /// Build a family from its unit list and pairwise conversion table.
    ///
    /// The table is not checked here; every [`UnitNumber`] built on the
    /// family validates it, so an incomplete table surfaces at the first
    /// construction.
    pub fn new(name: &str, units: &[&str], conversions: &[(&str, &str, Conversion)]) -> Self {
        Self {
            name: name.to_string(),
            units: units.iter().map(|u| u.to_string()).collect(),
            conversions: conversions
                .iter()
                .map(|(from, to, c)| ((from.to_string(), to.to_string()), *c))
                .collect(),
        }
    }

    /// A family without units, for plain dimensionless numbers.
    pub fn dimensionless(name: &str) -> Self {
        Self::new(name, &[], &[])
    }

    /// Family name, used in error messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Units this family supports, in declaration order.
    pub fn units(&self) -> &[String] {
        &self.units
    }

    /// Whether `unit` belongs to this family.
    pub fn contains(&self, unit: &str) -> bool {
        self.units.iter().any(|u| u == unit)
    }

    /// Conversion from one unit to another, if declared.
    pub fn conversion(&self, from: &str, to: &str) -> Option<Conversion> {
        self.conversions
            .get(&(from.to_string(), to.to_string()))
            .copied()
    }

    fn validate(&self) -> UnitResult<()> {
        for from in &self.units {
            for to in &self.units {
                if from != to && self.conversion(from, to).is_none() {
                    return Err(UnitError::IncompleteConversionTable {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn allowed(&self) -> String {
        self.units.join(", ")
    }
}

/// The quantity families known to the fraction collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    /// Volumetric flow rate of the pump.
    FlowRate,
    /// Durations.
    Time,
    /// Volumes.
    Volume,
    /// Tube counts tagged with the tube size.
    TubeSize,
    /// Dimensionless counts (number of fractions).
    Count,
}

impl Quantity {
    /// Shared family descriptor for this quantity.
    pub fn family(self) -> Arc<UnitFamily> {
        match self {
            Quantity::FlowRate => FLOW_RATE.clone(),
            Quantity::Time => TIME.clone(),
            Quantity::Volume => VOLUME.clone(),
            Quantity::TubeSize => TUBE_SIZE.clone(),
            Quantity::Count => COUNT.clone(),
        }
    }

    /// Unit all arithmetic on this quantity is performed in.
    pub fn canonical_unit(self) -> Option<&'static str> {
        match self {
            Quantity::FlowRate => Some("uL/sec"),
            Quantity::Time => Some("sec"),
            Quantity::Volume => Some("uL"),
            Quantity::TubeSize | Quantity::Count => None,
        }
    }
}

static FLOW_RATE: Lazy<Arc<UnitFamily>> = Lazy::new(|| {
    Arc::new(UnitFamily::new(
        "flow rate",
        &["uL/sec", "uL/min", "uL/hr", "mL/sec", "mL/min", "mL/hr"],
        &[
            ("uL/sec", "uL/min", F(60.0)),
            ("uL/sec", "uL/hr", F(3600.0)),
            ("uL/sec", "mL/sec", F(1.0 / 1000.0)),
            ("uL/sec", "mL/min", F(60.0 / 1000.0)),
            ("uL/sec", "mL/hr", F(3600.0 / 1000.0)),
            ("uL/min", "uL/sec", F(1.0 / 60.0)),
            ("uL/min", "uL/hr", F(60.0)),
            ("uL/min", "mL/sec", F(1.0 / (1000.0 * 60.0))),
            ("uL/min", "mL/min", F(1.0 / 1000.0)),
            ("uL/min", "mL/hr", F(60.0 / 1000.0)),
            ("uL/hr", "uL/sec", F(1.0 / 3600.0)),
            ("uL/hr", "uL/min", F(1.0 / 60.0)),
            ("uL/hr", "mL/sec", F(1.0 / (1000.0 * 3600.0))),
            ("uL/hr", "mL/min", F(1.0 / (1000.0 * 60.0))),
            ("uL/hr", "mL/hr", F(1.0 / 1000.0)),
            ("mL/sec", "uL/sec", F(1000.0)),
            ("mL/sec", "uL/min", F(1000.0 * 60.0)),
            ("mL/sec", "uL/hr", F(1000.0 * 3600.0)),
            ("mL/sec", "mL/min", F(60.0)),
            ("mL/sec", "mL/hr", F(3600.0)),
            ("mL/min", "uL/sec", F(1000.0 / 60.0)),
            ("mL/min", "uL/min", F(1000.0)),
            ("mL/min", "uL/hr", F(1000.0 * 60.0)),
            ("mL/min", "mL/sec", F(1.0 / 60.0)),
            ("mL/min", "mL/hr", F(60.0)),
            ("mL/hr", "uL/sec", F(1000.0 / 3600.0)),
            ("mL/hr", "uL/min", F(1000.0 / 60.0)),
            ("mL/hr", "uL/hr", F(1000.0)),
            ("mL/hr", "mL/sec", F(1.0 / 3600.0)),
            ("mL/hr", "mL/min", F(1.0 / 60.0)),
        ],
    ))
});

static TIME: Lazy<Arc<UnitFamily>> = Lazy::new(|| {
    Arc::new(UnitFamily::new(
        "time",
        &["ms", "sec", "min", "hr"],
        &[
            ("ms", "sec", F(1.0 / 1000.0)),
            ("ms", "min", F(1.0 / (1000.0 * 60.0))),
            ("ms", "hr", F(1.0 / (1000.0 * 3600.0))),
            ("sec", "ms", F(1000.0)),
            ("sec", "min", F(1.0 / 60.0)),
            ("sec", "hr", F(1.0 / 3600.0)),
            ("min", "ms", F(60.0 * 1000.0)),
            ("min", "sec", F(60.0)),
            ("min", "hr", F(1.0 / 60.0)),
            ("hr", "ms", F(3600.0 * 1000.0)),
            ("hr", "sec", F(3600.0)),
            ("hr", "min", F(60.0)),
        ],
    ))
});

static VOLUME: Lazy<Arc<UnitFamily>> = Lazy::new(|| {
    Arc::new(UnitFamily::new(
        "volume",
        &["uL", "mL", "L"],
        &[
            ("uL", "mL", F(1.0 / 1000.0)),
            ("uL", "L", F(1.0 / 1_000_000.0)),
            ("mL", "uL", F(1000.0)),
            ("mL", "L", F(1.0 / 1000.0)),
            ("L", "uL", F(1_000_000.0)),
            ("L", "mL", F(1000.0)),
        ],
    ))
});

// A count of 0.5 mL tubes says nothing about how many 1.5 mL tubes it is.
static TUBE_SIZE: Lazy<Arc<UnitFamily>> = Lazy::new(|| {
    use Conversion::Incompatible as X;
    Arc::new(UnitFamily::new(
        "tube size",
        &["0.5 mL", "1.0 mL", "1.5 mL"],
        &[
            ("0.5 mL", "1.0 mL", X),
            ("0.5 mL", "1.5 mL", X),
            ("1.0 mL", "0.5 mL", X),
            ("1.0 mL", "1.5 mL", X),
            ("1.5 mL", "0.5 mL", X),
            ("1.5 mL", "1.0 mL", X),
        ],
    ))
});

static COUNT: Lazy<Arc<UnitFamily>> = Lazy::new(|| Arc::new(UnitFamily::dimensionless("count")));

/// An immutable physical quantity: a finite value and an optional unit.
///
/// Conversions return new instances; the receiver is never modified.
#[derive(Debug, Clone)]
pub struct UnitNumber {
    value: f64,
    unit: Option<String>,
    family: Arc<UnitFamily>,
}

impl UnitNumber {
    /// Construct a quantity, validating value, unit and conversion table.
    ///
    /// # Errors
    /// - `IncompleteConversionTable` if the family lacks an off-diagonal factor
    /// - `InvalidQuantity` if `value` is NaN or infinite
    /// - `InvalidUnit` if `unit` is not allowed by the family
    pub fn new(value: f64, unit: Option<&str>, family: Arc<UnitFamily>) -> UnitResult<Self> {
        family.validate()?;

        if !value.is_finite() {
            return Err(UnitError::InvalidQuantity(value.to_string()));
        }

        let unit_ok = match unit {
            Some(u) => family.contains(u),
            None => family.units().is_empty(),
        };
        if !unit_ok {
            return Err(UnitError::InvalidUnit {
                unit: unit.unwrap_or("<none>").to_string(),
                allowed: family.allowed(),
            });
        }

        Ok(Self {
            value,
            unit: unit.map(str::to_string),
            family,
        })
    }

    /// Construct a quantity of one of the built-in families.
    pub fn of(quantity: Quantity, value: f64, unit: Option<&str>) -> UnitResult<Self> {
        Self::new(value, unit, quantity.family())
    }

    /// Flow rate, e.g. `UnitNumber::flow_rate(10.0, "uL/sec")`.
    pub fn flow_rate(value: f64, unit: &str) -> UnitResult<Self> {
        Self::of(Quantity::FlowRate, value, Some(unit))
    }

    /// Duration, e.g. `UnitNumber::time(90.0, "min")`.
    pub fn time(value: f64, unit: &str) -> UnitResult<Self> {
        Self::of(Quantity::Time, value, Some(unit))
    }

    /// Volume, e.g. `UnitNumber::volume(1.5, "mL")`.
    pub fn volume(value: f64, unit: &str) -> UnitResult<Self> {
        Self::of(Quantity::Volume, value, Some(unit))
    }

    /// Number of tubes of a given size.
    pub fn tube_size(value: f64, unit: &str) -> UnitResult<Self> {
        Self::of(Quantity::TubeSize, value, Some(unit))
    }

    /// Dimensionless count.
    pub fn count(value: f64) -> UnitResult<Self> {
        Self::of(Quantity::Count, value, None)
    }

    /// Parse `"<value> <unit>"` (or just `"<value>"` for unitless families).
    ///
    /// Everything after the first run of whitespace is the unit, so units
    /// containing spaces (`"3 0.5 mL"`) parse as expected.
    pub fn parse(text: &str, quantity: Quantity) -> UnitResult<Self> {
        let text = text.trim();
        let (number, unit) = match text.split_once(char::is_whitespace) {
            Some((number, unit)) => (number, Some(unit.trim())),
            None => (text, None),
        };
        let value: f64 = number
            .parse()
            .map_err(|_| UnitError::InvalidQuantity(number.to_string()))?;
        Self::of(quantity, value, unit)
    }

    /// Parse user input where an empty field means "not provided yet".
    ///
    /// Empty or whitespace-only input yields `Ok(None)`; any other input must
    /// be a valid quantity.
    pub fn from_input(text: &str, quantity: Quantity) -> UnitResult<Option<Self>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        Self::parse(text, quantity).map(Some)
    }

    /// Numeric value in the current unit.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Current unit, `None` for dimensionless quantities.
    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// Family this quantity belongs to.
    pub fn family(&self) -> &UnitFamily {
        &self.family
    }

    /// Return a copy of this quantity expressed in `target`.
    ///
    /// # Errors
    /// - `UnsupportedUnit` if `target` is not a unit of this family
    /// - `IncompatibleUnits` if the pair is declared non-convertible
    pub fn convert(&self, target: Option<&str>) -> UnitResult<Self> {
        if target == self.unit.as_deref() {
            return Self::new(self.value, target, self.family.clone());
        }

        let unsupported = || UnitError::UnsupportedUnit {
            unit: target.unwrap_or("<none>").to_string(),
            family: self.family.name().to_string(),
        };
        let (from, to) = match (self.unit.as_deref(), target) {
            (Some(from), Some(to)) if self.family.contains(to) => (from, to),
            _ => return Err(unsupported()),
        };

        match self.family.conversion(from, to) {
            Some(Conversion::Factor(factor)) => {
                Self::new(self.value * factor, Some(to), self.family.clone())
            }
            Some(Conversion::Incompatible) => Err(UnitError::IncompatibleUnits {
                from: from.to_string(),
                to: to.to_string(),
            }),
            None => Err(UnitError::IncompleteConversionTable {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }

    /// Render with the value floored (not rounded) to `places` decimals.
    ///
    /// `places == 0` floors too, so 4.7 seconds renders as `4 sec`. Use
    /// [`Display`](fmt::Display) for the unrounded value.
    pub fn to_string_places(&self, places: u32) -> String {
        self.render(floor_to_places(self.value, places))
    }

    fn render(&self, value: f64) -> String {
        match &self.unit {
            Some(unit) => format!("{} {}", value, unit),
            None => format!("{}", value),
        }
    }
}

impl PartialEq for UnitNumber {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
            && self.unit == other.unit
            && self.family.name() == other.family.name()
    }
}

impl fmt::Display for UnitNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(self.value))
    }
}

/// Floor `value` to `places` decimals by shifting the decimal exponent in
/// text, so that e.g. 0.29 floors to 0.29 rather than 0.28.
fn floor_to_places(value: f64, places: u32) -> f64 {
    let shift = |v: f64, by: i64| -> f64 {
        let text = format!("{:e}", v);
        match text.split_once('e') {
            Some((mantissa, exp)) => {
                let exp: i64 = exp.parse().unwrap_or(0);
                format!("{}e{}", mantissa, exp + by).parse().unwrap_or(v)
            }
            None => v,
        }
    };
    let places = i64::from(places);
    shift(shift(value, places).floor(), -places)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Quantity; 3] = [Quantity::FlowRate, Quantity::Time, Quantity::Volume];

    #[test]
    fn test_round_trip_conversion() {
        for quantity in ALL {
            let family = quantity.family();
            for from in family.units() {
                for to in family.units() {
                    let x = UnitNumber::of(quantity, 123.456, Some(from)).unwrap();
                    let back = x.convert(Some(to)).unwrap().convert(Some(from)).unwrap();
                    assert!(
                        (back.value() - x.value()).abs() < 1e-9,
                        "{} -> {} -> {} drifted to {}",
                        from,
                        to,
                        from,
                        back.value()
                    );
                    assert_eq!(back.unit(), Some(from.as_str()));
                }
            }
        }
    }

    #[test]
    fn test_identity_conversion() {
        let x = UnitNumber::volume(2.5, "mL").unwrap();
        let same = x.convert(Some("mL")).unwrap();
        assert_eq!(same, x);

        let n = UnitNumber::count(7.0).unwrap();
        assert_eq!(n.convert(None).unwrap(), n);
    }

    #[test]
    fn test_known_factors() {
        let rate = UnitNumber::flow_rate(1.0, "mL/hr").unwrap();
        let rate = rate.convert(Some("uL/min")).unwrap();
        assert!((rate.value() - 1000.0 / 60.0).abs() < 1e-12);

        let t = UnitNumber::time(2.0, "hr").unwrap().convert(Some("ms")).unwrap();
        assert_eq!(t.value(), 7_200_000.0);
    }

    #[test]
    fn test_invalid_unit() {
        let err = UnitNumber::volume(1.0, "gallon").unwrap_err();
        assert!(matches!(err, UnitError::InvalidUnit { .. }));

        // Dimensionless family must not carry a unit
        let err = UnitNumber::of(Quantity::Count, 1.0, Some("uL")).unwrap_err();
        assert!(matches!(err, UnitError::InvalidUnit { .. }));

        // Unit-bearing family must carry one
        let err = UnitNumber::of(Quantity::Time, 1.0, None).unwrap_err();
        assert!(matches!(err, UnitError::InvalidUnit { .. }));
    }

    #[test]
    fn test_invalid_quantity() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = UnitNumber::time(value, "sec").unwrap_err();
            assert!(matches!(err, UnitError::InvalidQuantity(_)));
        }
    }

    #[test]
    fn test_incomplete_table_fails_eagerly() {
        let family = Arc::new(UnitFamily::new(
            "length",
            &["mm", "cm", "m"],
            &[
                ("mm", "cm", Conversion::Factor(0.1)),
                ("cm", "mm", Conversion::Factor(10.0)),
            ],
        ));
        let err = UnitNumber::new(1.0, Some("mm"), family).unwrap_err();
        assert!(matches!(err, UnitError::IncompleteConversionTable { .. }));
    }

    #[test]
    fn test_unsupported_target() {
        let x = UnitNumber::volume(1.0, "uL").unwrap();
        assert!(matches!(
            x.convert(Some("sec")),
            Err(UnitError::UnsupportedUnit { .. })
        ));
        assert!(matches!(x.convert(None), Err(UnitError::UnsupportedUnit { .. })));
    }

    #[test]
    fn test_tube_sizes_do_not_convert() {
        let tubes = UnitNumber::tube_size(48.0, "1.5 mL").unwrap();
        assert!(matches!(
            tubes.convert(Some("0.5 mL")),
            Err(UnitError::IncompatibleUnits { .. })
        ));
        assert_eq!(tubes.to_string(), "48 1.5 mL");
    }

    #[test]
    fn test_display() {
        assert_eq!(UnitNumber::volume(1000.0, "uL").unwrap().to_string(), "1000 uL");
        assert_eq!(UnitNumber::count(10.0).unwrap().to_string(), "10");

        let x = UnitNumber::volume(1.239, "mL").unwrap();
        assert_eq!(x.to_string_places(2), "1.23 mL");
        let y = UnitNumber::count(0.29).unwrap();
        assert_eq!(y.to_string_places(2), "0.29");
        let z = UnitNumber::time(4.99, "sec").unwrap();
        assert_eq!(z.to_string_places(0), "4 sec");
    }

    #[test]
    fn test_parse() {
        let rate = UnitNumber::parse("10 uL/sec", Quantity::FlowRate).unwrap();
        assert_eq!(rate.value(), 10.0);
        assert_eq!(rate.unit(), Some("uL/sec"));

        let tubes = UnitNumber::parse("3 0.5 mL", Quantity::TubeSize).unwrap();
        assert_eq!(tubes.unit(), Some("0.5 mL"));

        let n = UnitNumber::parse(" 12 ", Quantity::Count).unwrap();
        assert_eq!(n.value(), 12.0);
        assert_eq!(n.unit(), None);

        assert!(matches!(
            UnitNumber::parse("NaN sec", Quantity::Time),
            Err(UnitError::InvalidQuantity(_))
        ));
        assert!(matches!(
            UnitNumber::parse("abc", Quantity::Count),
            Err(UnitError::InvalidQuantity(_))
        ));
    }

    #[test]
    fn test_from_input() {
        assert_eq!(UnitNumber::from_input("   ", Quantity::Volume).unwrap(), None);
        assert!(UnitNumber::from_input("5", Quantity::Volume).is_err());
        let v = UnitNumber::from_input("5 mL", Quantity::Volume).unwrap().unwrap();
        assert_eq!(v.to_string(), "5 mL");
    }
}
