use std::fmt::Debug;
use std::marker::PhantomData;

/// An unsigned counter that wraps around on the wire, e.g. a 32 bit TSN or a 16 bit stream
///  sequence number.
pub trait SequenceNumber: Copy + Debug + Into<u64> {
    const BITS: u32;

    /// keeps the low [Self::BITS] bits of an extended value
    fn truncate(extended: u64) -> Self;
}

impl SequenceNumber for u16 {
    const BITS: u32 = 16;

    fn truncate(extended: u64) -> Self {
        (extended & 0xffff) as u16
    }
}

impl SequenceNumber for u32 {
    const BITS: u32 = 32;

    fn truncate(extended: u64) -> Self {
        (extended & 0xffff_ffff) as u32
    }
}

/// Maps wrapping wire counters to monotonically comparable 64 bit 'extended' values.
///
/// A raw value is placed in the cycle that puts it nearest to the cursor, i.e. the highest
///  extended value that was accepted so far: a forward distance of up to half the counter range
///  counts as progress (possibly into the next cycle), anything else is interpreted as a value
///  from the past. Passing in a value that was already extended is fine: only its low bits are
///  used, so it maps to itself.
///
/// [SequenceNumberWrapper::wrap] is a pure lookup. The cursor moves only through
///  [SequenceNumberWrapper::advance], so values that the caller ends up rejecting (garbage from
///  the peer, stale acknowledgements) do not shift the mapping of later values.
#[derive(Debug, Clone)]
pub struct SequenceNumberWrapper<T: SequenceNumber> {
    cursor: Option<u64>,
    _counter: PhantomData<T>,
}

impl<T: SequenceNumber> Default for SequenceNumberWrapper<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SequenceNumber> SequenceNumberWrapper<T> {
    const MODULUS: u64 = 1 << T::BITS;
    const HALF: u64 = 1 << (T::BITS - 1);

    /// The first wrapped value is placed in cycle 0.
    pub fn new() -> SequenceNumberWrapper<T> {
        SequenceNumberWrapper {
            cursor: None,
            _counter: PhantomData,
        }
    }

    /// Anchors the wrapper at `initial` in cycle 1 rather than cycle 0. This leaves room below
    ///  the initial value so that e.g. 'initial - 1' as a cumulative ack point or late packets
    ///  from before the initial value are representable.
    pub fn starting_at(initial: T) -> SequenceNumberWrapper<T> {
        SequenceNumberWrapper {
            cursor: Some(Self::MODULUS + initial.into()),
            _counter: PhantomData,
        }
    }

    pub fn wrap(&self, value: impl Into<u64>) -> u64 {
        let raw = value.into() & (Self::MODULUS - 1);

        match self.cursor {
            None => raw,
            Some(cursor) => {
                let forward = raw.wrapping_sub(cursor) & (Self::MODULUS - 1);
                if forward <= Self::HALF {
                    cursor + forward
                }
                else {
                    let backward = Self::MODULUS - forward;
                    cursor.checked_sub(backward)
                        .unwrap_or(raw)
                }
            }
        }
    }

    /// Marks an extended value as accepted. The cursor never moves backwards.
    pub fn advance(&mut self, extended: u64) {
        self.cursor = Some(self.cursor.map_or(extended, |c| c.max(extended)));
    }

    pub fn unwrap(&self, extended: u64) -> T {
        T::truncate(extended)
    }
}
