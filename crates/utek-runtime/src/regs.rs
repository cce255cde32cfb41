//! Register/stack storage: program counter, link register, sixteen
//! untyped general-purpose slots, condition flags, and the bounded call
//! stack. Owned exclusively by one execution unit and reset on every run.

use crate::fault::Fault;

pub const GENERAL_SLOTS: usize = 16;
pub const DEFAULT_CALL_DEPTH: usize = 256;

/// One untyped general-purpose register slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Slot {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
}

impl Slot {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Slot::Int(v) => Some(*v),
            Slot::Null => Some(0),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Slot::Null => "null",
            Slot::Int(_) => "int",
            Slot::Float(_) => "float",
            Slot::Bool(_) => "bool",
            Slot::Str(_) => "str",
            Slot::Bytes(_) => "bytes",
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::Null => f.write_str("null"),
            Slot::Int(v) => write!(f, "{v}"),
            Slot::Float(v) => write!(f, "{v}"),
            Slot::Bool(v) => write!(f, "{v}"),
            Slot::Str(v) => f.write_str(v),
            Slot::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub zero: bool,
    pub negative: bool,
    pub carry: bool,
    pub overflow: bool,
    /// Result of the most recent IF/ASSERT condition evaluation.
    pub last_condition: bool,
}

#[derive(Debug)]
pub struct RegisterFile {
    pub pc: usize,
    pub link: usize,
    pub flags: Flags,
    slots: Vec<Slot>,
    call_stack: Vec<usize>,
    max_call_depth: usize,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_DEPTH)
    }
}

impl RegisterFile {
    pub fn new(max_call_depth: usize) -> Self {
        RegisterFile {
            pc: 0,
            link: 0,
            flags: Flags::default(),
            slots: vec![Slot::Null; GENERAL_SLOTS],
            call_stack: Vec::new(),
            max_call_depth,
        }
    }

    pub fn reset(&mut self) {
        self.pc = 0;
        self.link = 0;
        self.flags = Flags::default();
        self.slots.iter_mut().for_each(|s| *s = Slot::Null);
        self.call_stack.clear();
    }

    pub fn read(&self, index: usize) -> Result<&Slot, Fault> {
        self.slots
            .get(index)
            .ok_or_else(|| Fault::Decode(format!("register index {index} out of range")))
    }

    pub fn write(&mut self, index: usize, value: Slot) -> Result<(), Fault> {
        match self.slots.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Fault::Decode(format!("register index {index} out of range"))),
        }
    }

    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    /// Push the return address for a CALL. The link register mirrors the
    /// most recent return address.
    pub fn push_return(&mut self, address: usize) -> Result<(), Fault> {
        if self.call_stack.len() >= self.max_call_depth {
            return Err(Fault::StackFault(format!(
                "call stack overflow at depth {}",
                self.max_call_depth
            )));
        }
        self.link = address;
        self.call_stack.push(address);
        Ok(())
    }

    pub fn pop_return(&mut self) -> Result<usize, Fault> {
        let address = self
            .call_stack
            .pop()
            .ok_or_else(|| Fault::StackFault("RET with an empty call stack".to_string()))?;
        self.link = self.call_stack.last().copied().unwrap_or(0);
        Ok(address)
    }

    pub fn set_arith_flags(&mut self, result: i64, carry: bool, overflow: bool) {
        self.flags.zero = result == 0;
        self.flags.negative = result < 0;
        self.flags.carry = carry;
        self.flags.overflow = overflow;
    }

    pub fn set_compare_flags(&mut self, ordering: std::cmp::Ordering) {
        self.flags.zero = ordering == std::cmp::Ordering::Equal;
        self.flags.negative = ordering == std::cmp::Ordering::Less;
        self.flags.carry = false;
        self.flags.overflow = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_start_null_and_reset() {
        let mut regs = RegisterFile::default();
        regs.write(3, Slot::Int(42)).unwrap();
        regs.pc = 9;
        regs.reset();
        assert_eq!(regs.pc, 0);
        assert_eq!(*regs.read(3).unwrap(), Slot::Null);
    }

    #[test]
    fn out_of_range_register_is_a_decode_fault() {
        let mut regs = RegisterFile::default();
        assert!(matches!(regs.read(16), Err(Fault::Decode(_))));
        assert!(matches!(regs.write(99, Slot::Int(1)), Err(Fault::Decode(_))));
    }

    #[test]
    fn call_stack_is_lifo_and_bounded() {
        let mut regs = RegisterFile::new(2);
        regs.push_return(10).unwrap();
        regs.push_return(20).unwrap();
        assert!(matches!(regs.push_return(30), Err(Fault::StackFault(_))));
        assert_eq!(regs.pop_return().unwrap(), 20);
        assert_eq!(regs.link, 10);
        assert_eq!(regs.pop_return().unwrap(), 10);
        assert!(matches!(regs.pop_return(), Err(Fault::StackFault(_))));
    }

    #[test]
    fn arithmetic_flags() {
        let mut regs = RegisterFile::default();
        regs.set_arith_flags(0, false, false);
        assert!(regs.flags.zero);
        regs.set_arith_flags(-5, true, false);
        assert!(regs.flags.negative);
        assert!(regs.flags.carry);
        assert!(!regs.flags.zero);
    }
}
