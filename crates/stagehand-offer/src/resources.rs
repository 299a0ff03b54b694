//! Resource algebra over a single offer.
//!
//! A [`ResourcePool`] is what is left of an offer while a pod instance's
//! requirement is being matched against it. Consuming from the pool is the
//! subtraction of requirement from offer: scalars subtract with a small
//! tolerance, ranges split around the values taken, and reserved resources
//! are claimed whole by reservation id.

use std::collections::BTreeMap;

use stagehand_core::{Offer, Range, Resource, Value};
use thiserror::Error;

/// Tolerance for scalar comparisons.
pub const EPSILON: f64 = 1e-6;

/// Why a requirement could not be satisfied from an offer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Shortfall {
    #[error("insufficient {name}: needed {needed}, available {available}")]
    Scalar {
        name: String,
        needed: f64,
        available: f64,
    },

    #[error("port {0} is not offered")]
    Port(u64),

    #[error("no free port left in offer")]
    NoFreePort,

    #[error("reservation {0} is not in the offer")]
    MissingReservation(String),

    #[error("volume {0} is not in the offer")]
    MissingVolume(String),
}

/// Remaining resources of an offer, split into unreserved and reserved.
#[derive(Debug, Clone, Default)]
pub struct ResourcePool {
    unreserved_scalars: BTreeMap<String, f64>,
    unreserved_ranges: BTreeMap<String, Vec<Range>>,
    reserved: BTreeMap<String, Resource>,
}

impl ResourcePool {
    /// Build a pool from an offer. Reservations made under other roles are ignored.
    pub fn from_offer(offer: &Offer, role: &str) -> Self {
        let mut pool = Self::default();
        for resource in &offer.resources {
            match &resource.reservation {
                None => pool.add_unreserved(resource),
                Some(reservation) if reservation.role == role => {
                    pool.add_reserved(resource);
                }
                Some(_) => {}
            }
        }
        pool
    }

    fn add_unreserved(&mut self, resource: &Resource) {
        match &resource.value {
            Value::Scalar(v) => {
                *self
                    .unreserved_scalars
                    .entry(resource.name.clone())
                    .or_insert(0.0) += v;
            }
            Value::Ranges(ranges) => {
                let entry = self
                    .unreserved_ranges
                    .entry(resource.name.clone())
                    .or_default();
                entry.extend(ranges.iter().copied());
                *entry = coalesce(std::mem::take(entry));
            }
        }
    }

    fn add_reserved(&mut self, resource: &Resource) {
        let Some(id) = resource.resource_id() else {
            return;
        };
        match self.reserved.get_mut(id) {
            Some(existing) => {
                if let (Value::Scalar(a), Value::Scalar(b)) = (&mut existing.value, &resource.value) {
                    *a += b;
                }
            }
            None => {
                self.reserved.insert(id.to_string(), resource.clone());
            }
        }
    }

    /// Unreserved amount of a scalar resource.
    pub fn unreserved_scalar(&self, name: &str) -> f64 {
        self.unreserved_scalars.get(name).copied().unwrap_or(0.0)
    }

    /// Sum of every unreserved scalar left in the pool.
    pub fn unreserved_total(&self) -> f64 {
        self.unreserved_scalars.values().sum()
    }

    pub fn unreserved_ranges(&self, name: &str) -> &[Range] {
        self.unreserved_ranges
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Reserved resources not yet claimed.
    pub fn reserved(&self) -> impl Iterator<Item = &Resource> {
        self.reserved.values()
    }

    /// Take `amount` of an unreserved scalar.
    pub fn consume_scalar(&mut self, name: &str, amount: f64) -> Result<Resource, Shortfall> {
        let available = self.unreserved_scalar(name);
        if amount > available + EPSILON {
            return Err(Shortfall::Scalar {
                name: name.to_string(),
                needed: amount,
                available,
            });
        }
        self.unreserved_scalars
            .insert(name.to_string(), (available - amount).max(0.0));
        Ok(Resource::scalar(name, amount))
    }

    /// Take one specific value out of an unreserved range resource.
    pub fn consume_value(&mut self, name: &str, value: u64) -> Result<u64, Shortfall> {
        let ranges = self.unreserved_ranges.entry(name.to_string()).or_default();
        if subtract_value(ranges, value) {
            Ok(value)
        } else {
            Err(Shortfall::Port(value))
        }
    }

    /// Take the lowest free value out of an unreserved range resource.
    pub fn consume_any_value(&mut self, name: &str) -> Result<u64, Shortfall> {
        let lowest = self
            .unreserved_ranges
            .get(name)
            .and_then(|ranges| ranges.first())
            .map(|r| r.begin)
            .ok_or(Shortfall::NoFreePort)?;
        self.consume_value(name, lowest)
    }

    /// Hand a claimed reservation's value back as unreserved, as an
    /// UNRESERVE in the same batch would.
    pub fn release(&mut self, resource: &Resource) {
        self.add_unreserved(resource);
    }

    /// Claim a reserved resource whole.
    pub fn consume_reserved(&mut self, resource_id: &str) -> Result<Resource, Shortfall> {
        self.reserved
            .remove(resource_id)
            .ok_or_else(|| Shortfall::MissingReservation(resource_id.to_string()))
    }
}

/// Sort and merge overlapping or adjacent ranges.
pub fn coalesce(mut ranges: Vec<Range>) -> Vec<Range> {
    ranges.sort();
    let mut merged: Vec<Range> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.begin <= last.end.saturating_add(1) => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Remove one value from a set of ranges, splitting the range containing it.
/// Returns false when the value is not present.
pub fn subtract_value(ranges: &mut Vec<Range>, value: u64) -> bool {
    let Some(pos) = ranges.iter().position(|r| r.contains(value)) else {
        return false;
    };
    let range = ranges.remove(pos);
    let mut insert_at = pos;
    if range.begin < value {
        ranges.insert(insert_at, Range::new(range.begin, value - 1));
        insert_at += 1;
    }
    if value < range.end {
        ranges.insert(insert_at, Range::new(value + 1, range.end));
    }
    true
}

/// Compact a set of values into ranges.
pub fn ranges_of(values: &[u64]) -> Vec<Range> {
    coalesce(values.iter().map(|v| Range::single(*v)).collect())
}
