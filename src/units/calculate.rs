//! Derive collection parameters from the ones the user entered.
//!
//! The flow rate is always known. Of the remaining four quantities
//! (total time, total volume, volume per fraction, number of fractions) the
//! user supplies one from each linked pair, {time, volume} and
//! {volume per fraction, count}, and the other two are derived.
//!
//! All arithmetic happens in canonical units (uL/sec, sec, uL, unitless);
//! results are converted to the display units the caller asks for.

use super::{Quantity, UnitNumber};
use crate::error::UnitResult;

/// Total volume and fraction count derived from time and fraction size.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeAndCount {
    /// Volume dispensed over the whole run.
    pub total_volume: UnitNumber,
    /// Number of fractions the run produces.
    pub number_of_fractions: UnitNumber,
}

/// Total volume and fraction size derived from time and fraction count.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeAndFractionSize {
    /// Volume dispensed over the whole run.
    pub total_volume: UnitNumber,
    /// Volume collected in each tube.
    pub volume_per_fraction: UnitNumber,
}

/// Total time and fraction count derived from volume and fraction size.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeAndCount {
    /// Duration of the whole run.
    pub total_time: UnitNumber,
    /// Number of fractions the run produces.
    pub number_of_fractions: UnitNumber,
}

/// Total time and fraction size derived from volume and fraction count.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeAndFractionSize {
    /// Duration of the whole run.
    pub total_time: UnitNumber,
    /// Volume collected in each tube.
    pub volume_per_fraction: UnitNumber,
}

fn canonical(x: &UnitNumber, quantity: Quantity) -> UnitResult<UnitNumber> {
    x.convert(quantity.canonical_unit())
}

fn total_volume(flow_rate: &UnitNumber, total_time: &UnitNumber) -> UnitResult<UnitNumber> {
    UnitNumber::of(
        Quantity::Volume,
        total_time.value() * flow_rate.value(),
        Quantity::Volume.canonical_unit(),
    )
}

fn number_of_fractions(
    total_volume: &UnitNumber,
    volume_per_fraction: &UnitNumber,
) -> UnitResult<UnitNumber> {
    UnitNumber::count(total_volume.value() / volume_per_fraction.value())
}

fn volume_per_fraction(
    total_volume: &UnitNumber,
    number_of_fractions: &UnitNumber,
) -> UnitResult<UnitNumber> {
    UnitNumber::of(
        Quantity::Volume,
        total_volume.value() / number_of_fractions.value(),
        Quantity::Volume.canonical_unit(),
    )
}

fn total_time(flow_rate: &UnitNumber, total_volume: &UnitNumber) -> UnitResult<UnitNumber> {
    UnitNumber::of(
        Quantity::Time,
        total_volume.value() / flow_rate.value(),
        Quantity::Time.canonical_unit(),
    )
}

/// Known: total time and volume per fraction.
pub fn from_total_time_and_fraction_size(
    flow_rate: &UnitNumber,
    total_time: &UnitNumber,
    fraction_size: &UnitNumber,
    total_volume_unit: Option<&str>,
    count_unit: Option<&str>,
) -> UnitResult<VolumeAndCount> {
    let flow_rate = canonical(flow_rate, Quantity::FlowRate)?;
    let total_time = canonical(total_time, Quantity::Time)?;
    let fraction_size = canonical(fraction_size, Quantity::Volume)?;

    let volume = total_volume(&flow_rate, &total_time)?;
    Ok(VolumeAndCount {
        number_of_fractions: number_of_fractions(&volume, &fraction_size)?.convert(count_unit)?,
        total_volume: volume.convert(total_volume_unit)?,
    })
}

/// Known: total time and number of fractions.
pub fn from_total_time_and_count(
    flow_rate: &UnitNumber,
    total_time: &UnitNumber,
    count: &UnitNumber,
    total_volume_unit: Option<&str>,
    fraction_size_unit: Option<&str>,
) -> UnitResult<VolumeAndFractionSize> {
    let flow_rate = canonical(flow_rate, Quantity::FlowRate)?;
    let total_time = canonical(total_time, Quantity::Time)?;
    let count = canonical(count, Quantity::Count)?;

    let volume = total_volume(&flow_rate, &total_time)?;
    Ok(VolumeAndFractionSize {
        volume_per_fraction: volume_per_fraction(&volume, &count)?.convert(fraction_size_unit)?,
        total_volume: volume.convert(total_volume_unit)?,
    })
}

/// Known: total volume and volume per fraction.
pub fn from_total_volume_and_fraction_size(
    flow_rate: &UnitNumber,
    total_volume: &UnitNumber,
    fraction_size: &UnitNumber,
    total_time_unit: Option<&str>,
    count_unit: Option<&str>,
) -> UnitResult<TimeAndCount> {
    let flow_rate = canonical(flow_rate, Quantity::FlowRate)?;
    let volume = canonical(total_volume, Quantity::Volume)?;
    let fraction_size = canonical(fraction_size, Quantity::Volume)?;

    Ok(TimeAndCount {
        total_time: total_time(&flow_rate, &volume)?.convert(total_time_unit)?,
        number_of_fractions: number_of_fractions(&volume, &fraction_size)?.convert(count_unit)?,
    })
}

/// Known: total volume and number of fractions.
pub fn from_total_volume_and_count(
    flow_rate: &UnitNumber,
    total_volume: &UnitNumber,
    count: &UnitNumber,
    total_time_unit: Option<&str>,
    fraction_size_unit: Option<&str>,
) -> UnitResult<TimeAndFractionSize> {
    let flow_rate = canonical(flow_rate, Quantity::FlowRate)?;
    let volume = canonical(total_volume, Quantity::Volume)?;
    let count = canonical(count, Quantity::Count)?;

    Ok(TimeAndFractionSize {
        total_time: total_time(&flow_rate, &volume)?.convert(total_time_unit)?,
        volume_per_fraction: volume_per_fraction(&volume, &count)?.convert(fraction_size_unit)?,
    })
}

/// Time one fraction takes to fill, in milliseconds.
///
/// This is the dispensing interval handed to
/// [`DeviceSession::setup`](crate::session::DeviceSession::setup).
pub fn collection_interval(
    flow_rate: &UnitNumber,
    fraction_size: &UnitNumber,
) -> UnitResult<UnitNumber> {
    let flow_rate = canonical(flow_rate, Quantity::FlowRate)?;
    let fraction_size = canonical(fraction_size, Quantity::Volume)?;
    total_time(&flow_rate, &fraction_size)?.convert(Some("ms"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UnitError;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn test_total_volume_from_time() {
        let flow = UnitNumber::flow_rate(10.0, "uL/sec").unwrap();
        let time = UnitNumber::time(100.0, "sec").unwrap();
        let size = UnitNumber::volume(100.0, "uL").unwrap();

        let out = from_total_time_and_fraction_size(&flow, &time, &size, Some("uL"), None).unwrap();
        assert!(close(out.total_volume.value(), 1000.0));
        assert_eq!(out.total_volume.unit(), Some("uL"));
        assert!(close(out.number_of_fractions.value(), 10.0));
        assert_eq!(out.number_of_fractions.unit(), None);
    }

    #[test]
    fn test_fraction_count_from_volume() {
        let flow = UnitNumber::flow_rate(10.0, "uL/sec").unwrap();
        let volume = UnitNumber::volume(1000.0, "uL").unwrap();
        let size = UnitNumber::volume(100.0, "uL").unwrap();

        let out = from_total_volume_and_fraction_size(&flow, &volume, &size, Some("sec"), None).unwrap();
        assert!(close(out.number_of_fractions.value(), 10.0));
        assert!(close(out.total_time.value(), 100.0));
    }

    #[test]
    fn test_display_units_differ_from_input_units() {
        let flow = UnitNumber::flow_rate(1.0, "mL/min").unwrap();
        let time = UnitNumber::time(1.0, "hr").unwrap();
        let count = UnitNumber::count(12.0).unwrap();

        let out = from_total_time_and_count(&flow, &time, &count, Some("mL"), Some("mL")).unwrap();
        assert!(close(out.total_volume.value(), 60.0));
        assert_eq!(out.total_volume.unit(), Some("mL"));
        assert!(close(out.volume_per_fraction.value(), 5.0));
    }

    #[test]
    fn test_total_time_from_volume_and_count() {
        let flow = UnitNumber::flow_rate(0.5, "mL/min").unwrap();
        let volume = UnitNumber::volume(0.03, "L").unwrap();
        let count = UnitNumber::count(60.0).unwrap();

        let out = from_total_volume_and_count(&flow, &volume, &count, Some("hr"), Some("uL")).unwrap();
        assert!(close(out.total_time.value(), 1.0));
        assert!(close(out.volume_per_fraction.value(), 500.0));
    }

    #[test]
    fn test_collection_interval() {
        let flow = UnitNumber::flow_rate(6.0, "mL/hr").unwrap();
        let size = UnitNumber::volume(100.0, "uL").unwrap();
        let interval = collection_interval(&flow, &size).unwrap();
        assert_eq!(interval.unit(), Some("ms"));
        assert!(close(interval.value(), 60_000.0));
    }

    #[test]
    fn test_zero_fraction_size_is_rejected() {
        let flow = UnitNumber::flow_rate(10.0, "uL/sec").unwrap();
        let time = UnitNumber::time(100.0, "sec").unwrap();
        let size = UnitNumber::volume(0.0, "uL").unwrap();
        let err = from_total_time_and_fraction_size(&flow, &time, &size, Some("uL"), None).unwrap_err();
        assert!(matches!(err, UnitError::InvalidQuantity(_)));
    }

    #[test]
    fn test_wrong_family_is_rejected() {
        let not_a_flow = UnitNumber::volume(10.0, "uL").unwrap();
        let time = UnitNumber::time(100.0, "sec").unwrap();
        let size = UnitNumber::volume(10.0, "uL").unwrap();
        let err = from_total_time_and_fraction_size(&not_a_flow, &time, &size, Some("uL"), None)
            .unwrap_err();
        assert!(matches!(err, UnitError::UnsupportedUnit { .. }));
    }
}
