// src/types/hll.rs

//! HyperLogLog cardinality estimation.
//!
//! A sketch is stored as a string value: the `HYLL` magic followed by 2^14
//! one-byte registers. Members are hashed with xxh3; the low 14 bits pick a
//! register and the remaining 50 bits feed the leading-zero count. The count
//! comes from the register histogram, which covers small and large
//! cardinalities with one formula. The standard error is `1.04 / sqrt(16384)`,
//! about 0.81%.

use xxhash_rust::xxh3::xxh3_64;

use crate::engine::keyspace::{Shard, Value};
use crate::error::{Result, StoreError};

const HLL_P: u32 = 14;
const HLL_REGISTERS: usize = 1 << HLL_P;
const HLL_MAGIC: &[u8] = b"HYLL";
const HLL_DATA_SIZE: usize = HLL_MAGIC.len() + HLL_REGISTERS;
// 参与计数的 hash 位数，寄存器取值范围是 0..=HLL_Q + 1
const HLL_Q: usize = 64 - HLL_P as usize;
const ALPHA_INF: f64 = 0.5 / std::f64::consts::LN_2;

/// Dense register array.
#[derive(Debug, Clone, PartialEq)]
pub struct Sketch {
    registers: Vec<u8>,
}

impl Default for Sketch {
    fn default() -> Self {
        Sketch {
            registers: vec![0; HLL_REGISTERS],
        }
    }
}

impl Sketch {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != HLL_DATA_SIZE || !data.starts_with(HLL_MAGIC) {
            return Err(StoreError::InvalidHll);
        }
        if data[HLL_MAGIC.len()..].iter().any(|&reg| usize::from(reg) > HLL_Q + 1) {
            return Err(StoreError::InvalidHll);
        }
        Ok(Sketch {
            registers: data[HLL_MAGIC.len()..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(HLL_DATA_SIZE);
        data.extend_from_slice(HLL_MAGIC);
        data.extend_from_slice(&self.registers);
        data
    }

    /// Returns `true` if a register changed.
    pub fn add(&mut self, element: &[u8]) -> bool {
        let hash = xxh3_64(element);
        let index = (hash as usize) & (HLL_REGISTERS - 1);
        let rank = rho(hash >> HLL_P);
        if rank > self.registers[index] {
            self.registers[index] = rank;
            true
        } else {
            false
        }
    }

    pub fn merge(&mut self, other: &Sketch) {
        for (mine, theirs) in self.registers.iter_mut().zip(&other.registers) {
            *mine = (*mine).max(*theirs);
        }
    }

    /// Cardinality from the register histogram (Ertl's improved estimator).
    ///
    /// Needs no empirical bias tables and stays unbiased across the range
    /// where raw HyperLogLog hands over to linear counting.
    pub fn estimate(&self) -> u64 {
        let m = HLL_REGISTERS as f64;
        let mut histogram = [0u32; HLL_Q + 2];
        for &reg in &self.registers {
            histogram[usize::from(reg)] += 1;
        }

        let mut z = m * tau((m - f64::from(histogram[HLL_Q + 1])) / m);
        for k in (1..=HLL_Q).rev() {
            z += f64::from(histogram[k]);
            z *= 0.5;
        }
        z += m * sigma(f64::from(histogram[0]) / m);

        // 空 sketch: sigma(1) 为无穷大，结果为 0
        (ALPHA_INF * m * m / z).round() as u64
    }
}

/// `x + sum(x^(2^k) * 2^(k-1))`, iterated until the sum stops changing.
fn sigma(mut x: f64) -> f64 {
    if x == 1.0 {
        return f64::INFINITY;
    }
    let mut y = 1.0;
    let mut z = x;
    loop {
        x *= x;
        let prev = z;
        z += x * y;
        y += y;
        if z == prev {
            return z;
        }
    }
}

/// Correction for saturated registers.
fn tau(mut x: f64) -> f64 {
    if x == 0.0 || x == 1.0 {
        return 0.0;
    }
    let mut y = 1.0;
    let mut z = 1.0 - x;
    loop {
        x = x.sqrt();
        let prev = z;
        y *= 0.5;
        z -= (1.0 - x).powi(2) * y;
        if z == prev {
            return z / 3.0;
        }
    }
}

/// Position of the leftmost 1-bit in a `(64 - HLL_P)`-bit value, from 1.
fn rho(w: u64) -> u8 {
    let width = 64 - HLL_P;
    if w == 0 {
        return (width + 1) as u8;
    }
    (w.leading_zeros() - HLL_P + 1) as u8
}

/// Loads the sketch at `key`; `None` when absent.
fn load(shard: &mut Shard, key: &[u8], now: u64) -> Result<Option<Sketch>> {
    match shard.string(key, now)? {
        Some(data) => Sketch::decode(data).map(Some),
        None => Ok(None),
    }
}

/// PFADD key member [member ...]
/// Returns `true` when the sketch was created or any register changed.
pub fn pfadd(shard: &mut Shard, key: &[u8], members: &[Vec<u8>], now: u64) -> Result<bool> {
    let (mut sketch, existed) = match load(shard, key, now)? {
        Some(s) => (s, true),
        None => (Sketch::default(), false),
    };
    let mut changed = false;
    for m in members {
        changed |= sketch.add(m);
    }
    if changed || !existed {
        shard.replace_value(key, Value::String(sketch.encode()), now);
    }
    Ok(changed || !existed)
}

/// Folds the sketch at `key` into `into`; used for multi-key PFCOUNT/PFMERGE,
/// where the keys may live on different shards.
pub fn merge_into(shard: &mut Shard, key: &[u8], into: &mut Sketch, now: u64) -> Result<()> {
    if let Some(s) = load(shard, key, now)? {
        into.merge(&s);
    }
    Ok(())
}

/// Stores `sketch` at `key`, keeping any deadline the key already has.
pub fn store(shard: &mut Shard, key: &[u8], sketch: &Sketch, now: u64) -> Result<()> {
    // wrong type / corrupt destination must fail before overwrite
    load(shard, key, now)?;
    shard.replace_value(key, Value::String(sketch.encode()), now);
    Ok(())
}
