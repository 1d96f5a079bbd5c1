//! Guards the instruction table that compiled images depend on.
//!
//! Opcode numbers, mnemonics, operand kinds and classes are hashed with
//! FNV-1a; editing the table without updating [`PINNED_TABLE_HASH`] fails
//! the build's tests. Run the ignored `dump_table_hash` test to print the
//! new value after a deliberate change.

#[cfg(test)]
mod tests {
    use crate::machine::isa::{Instruction, NUM_OPCODES};

    const PINNED_TABLE_HASH: u64 = 16515603156926275400;

    struct Fnv(u64);

    impl Fnv {
        fn new() -> Self {
            Fnv(0xcbf2_9ce4_8422_2325)
        }

        fn feed(&mut self, bytes: &[u8]) {
            for &b in bytes {
                self.0 = (self.0 ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3);
            }
        }
    }

    macro_rules! table_hash {
        (
            $( $(#[$doc:meta])* $name:ident = $opcode:literal, $mnemonic:literal => [ $( $field:ident : $kind:ident ),* $(,)? ], $class:ident ),* $(,)?
        ) => {{
            let mut fnv = Fnv::new();
            $(
                fnv.feed(stringify!($name).as_bytes());
                fnv.feed(&[Instruction::$name as u8]);
                fnv.feed($mnemonic.as_bytes());
                $( fnv.feed(stringify!($kind).as_bytes()); )*
                fnv.feed(stringify!($class).as_bytes());
            )*
            fnv.0
        }};
    }

    fn table_hash() -> u64 {
        crate::for_each_instruction!(table_hash)
    }

    #[test]
    #[ignore]
    fn dump_table_hash() {
        println!("table hash = {}", table_hash());
    }

    #[test]
    fn table_is_pinned() {
        assert_eq!(table_hash(), PINNED_TABLE_HASH);
    }

    #[test]
    fn opcodes_are_dense_and_named_uniquely() {
        for opcode in 0..NUM_OPCODES {
            let instr = Instruction::try_from(opcode as u8).unwrap();
            assert_eq!(instr as usize, opcode);
            assert_eq!(Instruction::from_mnemonic(instr.mnemonic()), Some(instr));
        }
        assert!(Instruction::try_from(NUM_OPCODES as u8).is_err());
    }
}
