//! Call frame for function call stack management

use core_types::ObjId;

/// Call frame representing one function activation.
///
/// Stored on the call stack to track execution state: the closure being
/// executed (and its function, cached to save a hop through the heap),
/// the instruction pointer, and where the frame's slots start on the
/// value stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFrame {
    /// The closure being executed
    pub closure: ObjId,
    /// The closure's function object
    pub function: ObjId,
    /// Instruction pointer into the function's chunk
    pub ip: usize,
    /// Index of slot zero on the value stack
    pub slot_base: usize,
}

impl CallFrame {
    /// Create a new call frame starting at the top of a function.
    pub fn new(closure: ObjId, function: ObjId, slot_base: usize) -> Self {
        Self {
            closure,
            function,
            ip: 0,
            slot_base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_frame_new() {
        let frame = CallFrame::new(ObjId(1), ObjId(2), 5);
        assert_eq!(frame.closure, ObjId(1));
        assert_eq!(frame.function, ObjId(2));
        assert_eq!(frame.ip, 0);
        assert_eq!(frame.slot_base, 5);
    }
}
