use std::str::FromStr;

use crate::limits::{MAX_GUESTS, MIN_GUESTS};
use crate::model::{OverlapRule, Table};

use super::EngineError;

/// Tables to allocate for a party when every table is assumed to seat two.
pub fn tables_needed(guests: u32) -> Result<usize, EngineError> {
    if !(MIN_GUESTS..=MAX_GUESTS).contains(&guests) {
        return Err(EngineError::InvalidPartySize(guests));
    }
    Ok(guests.div_ceil(2) as usize)
}

/// How free tables are chosen for a party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackingPolicy {
    /// `tables_needed(guests)` tables, lowest numbers first. Real capacities are ignored;
    /// since no table seats fewer than two, the chosen set always seats the party.
    #[default]
    PairsPerTable,
    /// Largest free tables until the remainder fits one table, then the smallest table
    /// that seats the remainder.
    CapacityFit,
}

impl FromStr for PackingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pairs" | "pairs_per_table" | "legacy" => Ok(PackingPolicy::PairsPerTable),
            "capacity" | "capacity_fit" => Ok(PackingPolicy::CapacityFit),
            other => Err(format!("unknown packing policy: {other}")),
        }
    }
}

impl PackingPolicy {
    /// Pick tables for `guests` from `free` (ascending by number).
    /// The result is ascending by number.
    pub fn plan(self, free: &[Table], guests: u32) -> Result<Vec<Table>, EngineError> {
        let needed = tables_needed(guests)?;
        match self {
            PackingPolicy::PairsPerTable => {
                if free.len() < needed {
                    return Err(EngineError::InsufficientCapacity {
                        available: free.len(),
                        needed,
                    });
                }
                Ok(free[..needed].to_vec())
            }
            PackingPolicy::CapacityFit => capacity_fit(free, guests),
        }
    }
}

fn capacity_fit(free: &[Table], guests: u32) -> Result<Vec<Table>, EngineError> {
    // Largest first; equal capacities keep ascending number order.
    let mut pool: Vec<&Table> = free.iter().collect();
    pool.sort_by(|a, b| b.capacity.cmp(&a.capacity).then(a.number.cmp(&b.number)));

    let mut chosen: Vec<Table> = Vec::new();
    let mut remaining = guests;
    while remaining > 0 {
        let best_fit = pool
            .iter()
            .enumerate()
            .filter(|(_, t)| t.capacity >= remaining)
            .min_by(|(_, a), (_, b)| a.capacity.cmp(&b.capacity).then(a.number.cmp(&b.number)))
            .map(|(i, _)| i);
        let idx = match best_fit {
            Some(i) => i,
            None if !pool.is_empty() => 0,
            None => {
                return Err(EngineError::InsufficientCapacity {
                    available: free.len(),
                    needed: chosen.len() + 1,
                });
            }
        };
        let table = pool.remove(idx);
        remaining = remaining.saturating_sub(table.capacity);
        chosen.push(table.clone());
    }
    chosen.sort_by_key(|t| t.number);
    Ok(chosen)
}

/// Engine-wide allocation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnginePolicy {
    pub overlap: OverlapRule,
    pub packing: PackingPolicy,
}
