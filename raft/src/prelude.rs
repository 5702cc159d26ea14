//! Internal prelude so modules don't each have to import `alloc` collections by hand.

pub(crate) use alloc::vec::Vec;
