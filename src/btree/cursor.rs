//! # Cursor State
//!
//! Each index carries one cursor: the leaf the last operation landed on,
//! its chain neighbours, the data position stored there, and the BOF/EOF
//! flags navigation checks before following a link.
//!
//! BOF is set when the current leaf has no predecessor (or is the chain
//! head); EOF is set when the next leaf is the EOF sentinel or missing. On
//! an empty index both first and last leaf are the sentinel, so a freshly
//! positioned cursor reads as both BOF and EOF.

use crate::config::NIL_POS;

#[derive(Debug, Clone)]
pub(crate) struct Cursor {
    current: i64,
    next: i64,
    prev: i64,
    data_pos: i64,
    bof: bool,
    eof: bool,
}

impl Cursor {
    pub fn new() -> Self {
        Self {
            current: NIL_POS,
            next: NIL_POS,
            prev: NIL_POS,
            data_pos: NIL_POS,
            bof: false,
            eof: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Repositions the cursor and derives the BOF/EOF flags from the
    /// index's chain anchors.
    pub fn set(
        &mut self,
        current: i64,
        next: i64,
        prev: i64,
        data_pos: i64,
        first_leaf: i64,
        last_leaf: i64,
    ) {
        self.current = current;
        self.next = next;
        self.prev = prev;
        self.data_pos = data_pos;
        self.bof = prev == NIL_POS || current == first_leaf;
        self.eof = next == NIL_POS || next == last_leaf;
    }

    pub fn current(&self) -> i64 {
        self.current
    }

    pub fn next(&self) -> i64 {
        self.next
    }

    pub fn prev(&self) -> i64 {
        self.prev
    }

    pub fn data_pos(&self) -> i64 {
        self.data_pos
    }

    pub fn is_bof(&self) -> bool {
        self.bof
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_cursor_is_unpositioned() {
        let cursor = Cursor::new();

        assert_eq!(cursor.current(), NIL_POS);
        assert_eq!(cursor.data_pos(), NIL_POS);
        assert!(!cursor.is_bof());
        assert!(!cursor.is_eof());
    }

    #[test]
    fn first_leaf_sets_bof() {
        let mut cursor = Cursor::new();

        cursor.set(100, 200, NIL_POS, 5, 100, 900);

        assert!(cursor.is_bof());
        assert!(!cursor.is_eof());
        assert_eq!(cursor.data_pos(), 5);
    }

    #[test]
    fn leaf_before_sentinel_sets_eof() {
        let mut cursor = Cursor::new();

        cursor.set(300, 900, 200, 7, 100, 900);

        assert!(!cursor.is_bof());
        assert!(cursor.is_eof());
    }

    #[test]
    fn middle_leaf_is_neither_bof_nor_eof() {
        let mut cursor = Cursor::new();

        cursor.set(200, 300, 100, 6, 100, 900);

        assert!(!cursor.is_bof());
        assert!(!cursor.is_eof());
    }

    #[test]
    fn sentinel_alone_reads_bof_and_eof() {
        let mut cursor = Cursor::new();

        // empty index: first_leaf == last_leaf == sentinel
        cursor.set(900, NIL_POS, NIL_POS, NIL_POS, 900, 900);

        assert!(cursor.is_bof());
        assert!(cursor.is_eof());
    }

    #[test]
    fn reset_clears_position_and_flags() {
        let mut cursor = Cursor::new();
        cursor.set(100, 200, NIL_POS, 5, 100, 900);

        cursor.reset();

        assert_eq!(cursor.current(), NIL_POS);
        assert!(!cursor.is_bof());
        assert!(!cursor.is_eof());
    }
}
