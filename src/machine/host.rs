//! Host state shared between contexts.
//!
//! The property list and the random seed outlive any single call, so they
//! belong to the host rather than to a machine. A host creates one
//! [`SharedState`] and registers its [`natives`](SharedState::natives) in
//! every context that should see the same properties and random sequence.

use super::cell::{Cell, UCell};
use super::errors::AmxError;
use super::natives::{Native, arg, arg_count, native};
use super::vm::Machine;
use dashmap::DashMap;
use rand_core::{OsRng, RngCore, impls};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Seed used until the host asks for entropy.
pub const INITIAL_SEED: u32 = 0xcaa9_38db;
const RMULT: u32 = 1_103_515_245;

/// Multiplicative congruential generator returning 31-bit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptRng {
    seed: u32,
}

impl ScriptRng {
    pub fn new(seed: u32) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Next value for `seed` and the seed that follows it.
    fn advance(seed: u32) -> (u32, u32) {
        let lo = seed & 0xffff;
        let hi = seed >> 16;
        let ll = lo.wrapping_mul(RMULT & 0xffff);
        let lh = lo.wrapping_mul(RMULT >> 16);
        let hl = hi.wrapping_mul(RMULT & 0xffff);
        let hh = hi.wrapping_mul(RMULT >> 16);
        let value = (ll.wrapping_add(12345) >> 16)
            .wrapping_add(lh)
            .wrapping_add(hl)
            .wrapping_add(hh << 16);
        let next = seed.wrapping_mul(RMULT).wrapping_add(12345);
        (value & 0x7fff_ffff, next)
    }
}

impl RngCore for ScriptRng {
    fn next_u32(&mut self) -> u32 {
        let (value, next) = Self::advance(self.seed);
        self.seed = next;
        value
    }

    fn next_u64(&mut self) -> u64 {
        impls::next_u64_via_u32(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// A named value in the property list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// Name as first stored; lookups ignore ASCII case.
    pub name: String,
    pub value: Cell,
}

/// Property list and random seed shared by the contexts of one host.
#[derive(Debug)]
pub struct SharedState {
    /// Keyed by id and lowercased name.
    properties: DashMap<(Cell, String), Property>,
    seed: AtomicU32,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    /// State with the fixed initial seed, so random sequences repeat.
    pub fn new() -> Self {
        Self::with_seed(INITIAL_SEED)
    }

    pub fn with_seed(seed: u32) -> Self {
        Self {
            properties: DashMap::new(),
            seed: AtomicU32::new(seed),
        }
    }

    /// State seeded from the operating system.
    pub fn with_entropy() -> Self {
        match OsRng.next_u32() {
            0 => Self::new(),
            seed => Self::with_seed(seed),
        }
    }

    /// Draws the next random value, below `max` unless `max` is 0.
    pub fn random(&self, max: Cell) -> Cell {
        let previous = self
            .seed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |seed| {
                Some(ScriptRng::advance(seed).1)
            })
            .unwrap_or_else(|seed| seed);
        let value = ScriptRng::advance(previous).0;
        if max == 0 {
            return value as Cell;
        }
        // reduce at full cell width so wide bounds are not truncated
        ((value as UCell) % (max as UCell)) as Cell
    }

    /// Key of the property `name` under `id`, or of the first one holding
    /// `value` when `name` is empty.
    fn find(&self, id: Cell, name: &str, value: Cell) -> Option<(Cell, String)> {
        if !name.is_empty() {
            let key = (id, name.to_ascii_lowercase());
            return self.properties.contains_key(&key).then_some(key);
        }
        self.properties
            .iter()
            .find(|entry| entry.key().0 == id && entry.value().value == value)
            .map(|entry| entry.key().clone())
    }

    /// Value of a property; for a lookup by value, also its name.
    pub fn get(&self, id: Cell, name: &str, value: Cell) -> Option<Property> {
        let key = self.find(id, name, value)?;
        self.properties.get(&key).map(|entry| entry.value().clone())
    }

    /// Stores a property and returns the value it replaced, or 0.
    ///
    /// With an empty `name` the property holding `value` is renamed to
    /// `fallback_name`, or created under that name.
    pub fn set(&self, id: Cell, name: &str, value: Cell, fallback_name: &str) -> Cell {
        let found = self.find(id, name, value);
        let previous = found
            .as_ref()
            .and_then(|key| self.properties.remove(key))
            .map_or(0, |(_, property)| property.value);
        let name = if name.is_empty() { fallback_name } else { name };
        self.properties.insert(
            (id, name.to_ascii_lowercase()),
            Property {
                name: name.to_string(),
                value,
            },
        );
        previous
    }

    /// Removes a property and returns its value, or 0.
    pub fn delete(&self, id: Cell, name: &str, value: Cell) -> Cell {
        self.find(id, name, value)
            .and_then(|key| self.properties.remove(&key))
            .map_or(0, |(_, property)| property.value)
    }

    pub fn exists(&self, id: Cell, name: &str, value: Cell) -> bool {
        self.find(id, name, value).is_some()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Natives backed by this state, ready for
    /// [`Machine::register_natives`].
    pub fn natives(self: &Arc<Self>) -> Vec<(&'static str, Native)> {
        let random = Arc::clone(self);
        let get = Arc::clone(self);
        let set = Arc::clone(self);
        let delete = Arc::clone(self);
        let exists = Arc::clone(self);
        vec![
            (
                "random",
                native(move |_, params| Ok(random.random(arg(params, 1)?))),
            ),
            (
                "getproperty",
                native(move |machine, params| {
                    let (id, name, value) = property_args(machine, params)?;
                    let Some(property) = get.get(id, &name, value) else {
                        return Ok(0);
                    };
                    if name.is_empty() && arg_count(params) >= 5 {
                        let size = usize::try_from(arg(params, 5)?).unwrap_or(0);
                        if size > 0 {
                            machine.set_string(arg(params, 4)?, &property.name, true, size)?;
                        }
                    }
                    Ok(property.value)
                }),
            ),
            (
                "setproperty",
                native(move |machine, params| {
                    let (id, name, value) = property_args(machine, params)?;
                    let fallback = if name.is_empty() {
                        string_arg(machine, params, 4)?
                    } else {
                        String::new()
                    };
                    Ok(set.set(id, &name, value, &fallback))
                }),
            ),
            (
                "deleteproperty",
                native(move |machine, params| {
                    let (id, name, value) = property_args(machine, params)?;
                    Ok(delete.delete(id, &name, value))
                }),
            ),
            (
                "existproperty",
                native(move |machine, params| {
                    let (id, name, value) = property_args(machine, params)?;
                    Ok(Cell::from(exists.exists(id, &name, value)))
                }),
            ),
        ]
    }
}

/// String argument `index`; empty when the script left it out.
fn string_arg(machine: &Machine, params: &[Cell], index: usize) -> Result<String, AmxError> {
    if index > arg_count(params) {
        return Ok(String::new());
    }
    machine.get_string(arg(params, index)?)
}

/// The `(id, name, value)` triple every property native starts with.
fn property_args(machine: &Machine, params: &[Cell]) -> Result<(Cell, String, Cell), AmxError> {
    let count = arg_count(params);
    let id = if count >= 1 { arg(params, 1)? } else { 0 };
    let name = string_arg(machine, params, 2)?;
    let value = if count >= 3 { arg(params, 3)? } else { Cell::MIN };
    Ok((id, name, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::assembler::assemble_source;
    use crate::machine::cell::CELL;
    use crate::machine::image::Image;
    use crate::machine::vm::Entry;

    fn machine(state: &Arc<SharedState>) -> Machine {
        let source = "main:\nPUSH_C 100\nSYSREQ_N \"random\" 4\nHALT 0\n";
        let image = Image::from_bytes(assemble_source(source).unwrap()).unwrap();
        let mut machine = Machine::load(image).unwrap();
        machine.register_natives(&state.natives()).unwrap();
        machine
    }

    fn call(natives: &[(&str, Native)], name: &str, m: &mut Machine, args: &[Cell]) -> Result<Cell, AmxError> {
        let (_, f) = natives.iter().find(|(n, _)| *n == name).unwrap();
        let mut params = vec![args.len() as Cell * CELL];
        params.extend_from_slice(args);
        f(m, &params)
    }

    /// Heap copy of `text` as a packed string.
    fn string(m: &mut Machine, text: &str) -> Cell {
        let cells = text.len() / CELL as usize + 1;
        let addr = m.allot(cells).unwrap();
        m.set_string(addr, text, true, cells).unwrap();
        addr
    }

    #[test]
    fn random_sequence_is_reproducible() {
        let mut a = ScriptRng::new(INITIAL_SEED);
        let mut b = ScriptRng::new(INITIAL_SEED);
        let first: Vec<u32> = (0..8).map(|_| a.next_u32()).collect();
        let second: Vec<u32> = (0..8).map(|_| b.next_u32()).collect();
        assert_eq!(first, second);
        assert!(first.iter().all(|&v| v <= 0x7fff_ffff));
        assert_ne!(first[0], first[1]);
    }

    #[test]
    fn generator_matches_reference_arithmetic() {
        let seed = INITIAL_SEED as u64;
        let expected = (seed * RMULT as u64 + 12345) >> 16;
        let mut rng = ScriptRng::new(INITIAL_SEED);
        assert_eq!(rng.next_u32() as u64, expected & 0x7fff_ffff);
        assert_eq!(rng.seed(), INITIAL_SEED.wrapping_mul(RMULT).wrapping_add(12345));
    }

    #[test]
    fn random_native_respects_bound() {
        let state = Arc::new(SharedState::new());
        let mut m = machine(&state);
        for _ in 0..32 {
            let value = m.exec(Entry::Main).unwrap();
            assert!((0..100).contains(&value));
        }
    }

    #[test]
    fn random_reduces_at_cell_width() {
        let state = SharedState::new();
        for _ in 0..64 {
            assert!((0..Cell::MAX).contains(&state.random(Cell::MAX)));
        }
    }

    #[cfg(feature = "cell64")]
    #[test]
    fn random_bound_wider_than_32_bits() {
        let wide: Cell = 1 << 32;
        let state = SharedState::new();
        for _ in 0..64 {
            assert!((0..wide).contains(&state.random(wide)));
        }
        // every 31-bit draw is already below the bound
        assert_eq!(SharedState::new().random(wide), SharedState::new().random(0));
    }

    #[test]
    fn contexts_share_one_sequence() {
        let shared = Arc::new(SharedState::new());
        let mut a = machine(&shared);
        let mut b = machine(&shared);
        let interleaved = [a.exec(Entry::Main).unwrap(), b.exec(Entry::Main).unwrap()];

        let alone = Arc::new(SharedState::new());
        let mut c = machine(&alone);
        let sequential = [c.exec(Entry::Main).unwrap(), c.exec(Entry::Main).unwrap()];
        assert_eq!(interleaved, sequential);
    }

    #[test]
    fn properties_by_name_ignore_case() {
        let state = Arc::new(SharedState::new());
        let natives = state.natives();
        let mut m = machine(&state);
        let name = string(&mut m, "Color");
        let upper = string(&mut m, "COLOR");

        assert_eq!(call(&natives, "setproperty", &mut m, &[0, name, 5]), Ok(0));
        assert_eq!(call(&natives, "setproperty", &mut m, &[0, upper, 6]), Ok(5));
        assert_eq!(call(&natives, "getproperty", &mut m, &[0, name, 0]), Ok(6));
        assert_eq!(call(&natives, "existproperty", &mut m, &[1, name, 0]), Ok(0));
        assert_eq!(state.len(), 1);

        assert_eq!(call(&natives, "deleteproperty", &mut m, &[0, upper, 0]), Ok(6));
        assert_eq!(call(&natives, "existproperty", &mut m, &[0, name, 0]), Ok(0));
        assert!(state.is_empty());
    }

    #[test]
    fn lookup_by_value_returns_name() {
        let state = Arc::new(SharedState::new());
        let natives = state.natives();
        let mut m = machine(&state);
        let empty = string(&mut m, "");
        let label = string(&mut m, "speed");
        let out = m.allot(4).unwrap();

        // empty name: the string argument names the new property
        assert_eq!(call(&natives, "setproperty", &mut m, &[2, empty, 77, label]), Ok(0));
        assert_eq!(call(&natives, "existproperty", &mut m, &[2, label, 0]), Ok(1));
        assert_eq!(call(&natives, "getproperty", &mut m, &[2, empty, 77, out, 4]), Ok(77));
        assert_eq!(m.get_string(out).unwrap(), "speed");
        assert_eq!(call(&natives, "getproperty", &mut m, &[2, empty, 78, out, 4]), Ok(0));
    }

    #[test]
    fn missing_arguments_use_defaults() {
        let state = SharedState::new();
        state.set(0, "", Cell::MIN, "anon");
        assert!(state.exists(0, "ANON", 0));
        let natives = Arc::new(state).natives();
        let (_, exists) = &natives[4];
        let source = "main:\nHALT 0\n";
        let image = Image::from_bytes(assemble_source(source).unwrap()).unwrap();
        let mut m = Machine::load(image).unwrap();
        assert_eq!(exists(&mut m, &[0]), Ok(1));
    }
}
