//! Counting-set automata for regular expressions with bounded repetition.
//!
//! Based on Turoňová, Holík, Lengál, Saarikivi, Veanes and Vojnar,
//! "Regex Matching with Counting-Set Automata" (OOPSLA 2020)
//! <https://doi.org/10.1145/3428286>.
//!
//! A bounded repetition `body{min,max}` unrolled into a plain DFA costs
//! `O(max)` states per repetition, and determinizing the unrolled NFA can
//! cost `O(2^max)`.  A *counting automaton* (CA) instead keeps one
//! *counting state* per repetition and a counter that is incremented on
//! every loop iteration and checked against `[min, max]` on exit.  A
//! counting-set automaton (CsA) is the deterministic counterpart: each
//! counter holds the *set* of values reachable along the nondeterministic
//! runs that were merged into the current deterministic state.
//!
//! # Architecture
//!
//! The pipeline is:
//!
//! ```text
//! CountingAutomaton ──product──> Automaton<CsPred>  ──determinize──>  Automaton<CsPred>
//!                                                                          │
//!                               CsAutomaton <──update synthesis───────────┘
//! ```
//!
//! ## Counter conditions
//!
//! The live value set of a counter is abstracted into four facts:
//!
//! ```text
//! EMPTY   the set is empty
//! LOW     nonempty, every value is below the lower bound
//! MIDDLE  some value is in [lower, upper], and the set is not {upper}
//! HIGH    the set is exactly {upper}
//! ```
//!
//! A [`CsCondition`] is any subset of these four facts (16 values).  A
//! [`CsConditionSeq`] packs up to [`MAX_COUNTERS`] conditions into one
//! `u64` per fact, so conjunction, disjunction and complement are a
//! handful of word operations.
//!
//! ## Counter updates
//!
//! A [`CsUpdate`] is any subset of `{SET0, SET1, INCR}`: insert 0, insert
//! 1, increment every value.  When several nondeterministic branches are
//! merged into one deterministic transition their updates are OR-ed
//! together, which is sound because each action is itself a set-union
//! effect on the live value set.
//!
//! ## Construction
//!
//! 1. **Product.**  Every CA move becomes a guard over (input symbol,
//!    counter conditions): moves leaving a counting state through an exit
//!    require `CANEXIT`, increments require `CANLOOP`.
//! 2. **Determinize.**  Symbolic subset construction over the product
//!    guards ([`determinize`]).
//! 3. **Update synthesis.**  Every determinized guard is split into its
//!    disjoint minterms; the update of a minterm is the union of the
//!    per-state updates ([`CountingAutomaton::counter_update`]) of every
//!    original state in the source power-set state.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::io::{self, Write};
use std::ops::{BitAnd, BitOr, Index, Not};

use indexmap::map::Entry;
use indexmap::{IndexMap, IndexSet};
use regex_syntax::hir::{self, HirKind};

/// Re-export so users do not need a direct `regex-syntax` dependency.
pub use regex_syntax::hir::Class;

/// The maximum number of counters (and thus of positions in a condition or
/// update sequence): one bit per counter in a `u64`.
pub const MAX_COUNTERS: usize = 64;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while building or querying a counting-set automaton.
///
/// None of them is recoverable: construction either produces a complete
/// [`CsAutomaton`] or fails with the first error detected.
#[derive(Debug)]
pub enum Error {
    /// More than [`MAX_COUNTERS`] counters or conditions were requested.
    Capacity { requested: usize },
    /// A binary operator was applied to sequences of different length or
    /// polarity.
    IncompatibleOperands(&'static str),
    /// A sequence position past the end of the sequence.
    IndexOutOfRange { index: usize, len: usize },
    /// A counter id not below [`CsAutomaton::nr_of_counters`].
    CounterOutOfRange { id: usize, count: usize },
    /// A move leaving a counting state carries an operation other than an
    /// increment or an exit.
    UnexpectedCounterOp { state: StateIdx, op: CounterOp },
    /// A power-set state without members.
    EmptyState(StateIdx),
    /// A counter whose lower bound exceeds its upper bound.
    InvalidBounds { lower: u32, upper: u32 },
    /// A second counter was attached to a state that already has one.
    DuplicateCounter(StateIdx),
    /// A Unicode character class that cannot be lowered to single bytes
    /// (i.e. contains codepoints above U+00FF).
    UnsupportedClass(hir::Class),
    /// A predicate pattern that `regex-syntax` rejected.
    Syntax(regex_syntax::Error),
    /// A predicate pattern that parsed, but is not a single byte class.
    NotAClass(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capacity { requested } => write!(
                f,
                "more than {} counters are not supported (requested {})",
                MAX_COUNTERS, requested
            ),
            Self::IncompatibleOperands(msg) => write!(f, "incompatible arguments: {}", msg),
            Self::IndexOutOfRange { index, len } => {
                write!(f, "index {} out of range for sequence of length {}", index, len)
            }
            Self::CounterOutOfRange { id, count } => {
                write!(f, "counter id {} out of range ({} counters)", id, count)
            }
            Self::UnexpectedCounterOp { state, op } => {
                write!(f, "unexpected counter operation {} at counting state {}", op, state)
            }
            Self::EmptyState(state) => write!(f, "power-set state {} has no members", state),
            Self::InvalidBounds { lower, upper } => {
                write!(f, "invalid counter bounds [{}, {}]", lower, upper)
            }
            Self::DuplicateCounter(state) => {
                write!(f, "state {} is already a counting state", state)
            }
            Self::UnsupportedClass(class) => {
                write!(f, "unsupported character class: {:?}", class)
            }
            Self::Syntax(err) => write!(f, "invalid predicate pattern: {}", err),
            Self::NotAClass(pattern) => {
                write!(f, "predicate pattern is not a byte class: {:?}", pattern)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Syntax(err) => Some(err),
            _ => None,
        }
    }
}

impl From<regex_syntax::Error> for Error {
    fn from(err: regex_syntax::Error) -> Self {
        Self::Syntax(err)
    }
}

// ---------------------------------------------------------------------------
// State indices
// ---------------------------------------------------------------------------

/// Index of an automaton state.
///
/// In a determinized automaton the index is also the position of the
/// state's member set in the [`PowerSetStateBuilder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateIdx(pub usize);

impl StateIdx {
    #[inline]
    pub fn idx(self) -> usize {
        self.0
    }
}

impl fmt::Display for StateIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for StateIdx {
    fn from(idx: usize) -> Self {
        Self(idx)
    }
}

// ---------------------------------------------------------------------------
// Counter conditions
// ---------------------------------------------------------------------------

/// A condition on the live value set of one counter: a subset of the four
/// facts `LOW` (bit 1), `MIDDLE` (bit 2), `HIGH` (bit 4) and `EMPTY`
/// (bit 8).
///
/// Union, intersection and complement are total functions on the
/// enumeration (`|`, `&`, `!`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum CsCondition {
    /// Unsatisfiable condition.
    False = 0,
    /// Nonempty, and every value is below the lower bound.
    Low = 1,
    /// Some value is at least the lower bound, and the set is not the
    /// singleton upper bound.
    Middle = 2,
    /// An increment is possible: `LOW | MIDDLE`.
    CanLoop = 3,
    /// The set is the singleton upper bound.
    High = 4,
    /// `LOW | HIGH`.
    LowOrHigh = 5,
    /// An exit is possible: `MIDDLE | HIGH`.
    CanExit = 6,
    /// `LOW | MIDDLE | HIGH`.
    NonEmpty = 7,
    /// The set is empty.
    Empty = 8,
    /// `EMPTY | LOW`.
    CannotExit = 9,
    /// `EMPTY | MIDDLE`.
    EmptyOrMiddle = 10,
    /// `EMPTY | LOW | MIDDLE`.
    EmptyOrCanLoop = 11,
    /// `EMPTY | HIGH`.
    CannotLoop = 12,
    /// `EMPTY | LOW | HIGH`.
    EmptyOrHighOrLow = 13,
    /// `EMPTY | MIDDLE | HIGH`.
    EmptyOrCanExit = 14,
    /// No constraint.
    True = 15,
}

/// Backing storage for `Index` impls that hand out `&CsCondition`.
static CONDITION_TABLE: [CsCondition; 16] = CsCondition::ALL;

impl CsCondition {
    /// All 16 conditions, indexed by their bit mask.
    pub const ALL: [CsCondition; 16] = [
        CsCondition::False,
        CsCondition::Low,
        CsCondition::Middle,
        CsCondition::CanLoop,
        CsCondition::High,
        CsCondition::LowOrHigh,
        CsCondition::CanExit,
        CsCondition::NonEmpty,
        CsCondition::Empty,
        CsCondition::CannotExit,
        CsCondition::EmptyOrMiddle,
        CsCondition::EmptyOrCanLoop,
        CsCondition::CannotLoop,
        CsCondition::EmptyOrHighOrLow,
        CsCondition::EmptyOrCanExit,
        CsCondition::True,
    ];

    /// The four single-fact conditions.
    pub const FACTS: [CsCondition; 4] = [
        CsCondition::Empty,
        CsCondition::Low,
        CsCondition::Middle,
        CsCondition::High,
    ];

    #[inline]
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// The condition with the given fact mask; bits above the fourth are
    /// ignored.
    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        Self::ALL[(bits & 0xF) as usize]
    }

    /// True when every fact of `other` is a fact of `self`.
    #[inline]
    pub fn contains(self, other: CsCondition) -> bool {
        self.bits() & other.bits() == other.bits()
    }

    /// True when `self` and `other` share a fact.
    #[inline]
    pub fn intersects(self, other: CsCondition) -> bool {
        self.bits() & other.bits() != 0
    }

    /// The name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            CsCondition::False => "FALSE",
            CsCondition::Low => "LOW",
            CsCondition::Middle => "MIDDLE",
            CsCondition::CanLoop => "CANLOOP",
            CsCondition::High => "HIGH",
            CsCondition::LowOrHigh => "LOWorHIGH",
            CsCondition::CanExit => "CANEXIT",
            CsCondition::NonEmpty => "NONEMPTY",
            CsCondition::Empty => "EMPTY",
            CsCondition::CannotExit => "CANNOTEXIT",
            CsCondition::EmptyOrMiddle => "EMPTYorMIDDLE",
            CsCondition::EmptyOrCanLoop => "EMPTYorCANLOOP",
            CsCondition::CannotLoop => "CANNOTLOOP",
            CsCondition::EmptyOrHighOrLow => "EMPTYorHIGHorLOW",
            CsCondition::EmptyOrCanExit => "EMPTYorCANEXIT",
            CsCondition::True => "TRUE",
        }
    }
}

impl BitOr for CsCondition {
    type Output = CsCondition;

    #[inline]
    fn bitor(self, rhs: CsCondition) -> CsCondition {
        CsCondition::from_bits(self.bits() | rhs.bits())
    }
}

impl BitAnd for CsCondition {
    type Output = CsCondition;

    #[inline]
    fn bitand(self, rhs: CsCondition) -> CsCondition {
        CsCondition::from_bits(self.bits() & rhs.bits())
    }
}

impl Not for CsCondition {
    type Output = CsCondition;

    #[inline]
    fn not(self) -> CsCondition {
        CsCondition::from_bits(!self.bits())
    }
}

impl fmt::Display for CsCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// All-ones mask over the first `len` bits.
#[inline]
fn low_mask(len: usize) -> u64 {
    if len >= 64 {
        u64::MAX
    } else {
        (1u64 << len) - 1
    }
}

#[inline]
fn assign(word: u64, bit: u64, on: bool) -> u64 {
    if on {
        word | bit
    } else {
        word & !bit
    }
}

/// A sequence of up to [`MAX_COUNTERS`] counter conditions, position `i`
/// constraining counter `i`.
///
/// The sequence is either a conjunction ("every position holds") or a
/// disjunction ("some position holds").  It is stored as one `u64` per
/// fact, bit `i` of the `low` word being set iff position `i` contains
/// `LOW`, and so on.  Values are immutable: every operation returns a new
/// sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CsConditionSeq {
    is_and: bool,
    len: u8,
    /// Defined positions: the low `len` bits.
    mask: u64,
    empty: u64,
    low: u64,
    middle: u64,
    high: u64,
}

impl CsConditionSeq {
    /// A conjunction of the given per-counter conditions.
    pub fn mk_and(conds: &[CsCondition]) -> Result<Self, Error> {
        Self::mk_seq(true, conds)
    }

    /// A disjunction of the given per-counter conditions.
    pub fn mk_or(conds: &[CsCondition]) -> Result<Self, Error> {
        Self::mk_seq(false, conds)
    }

    /// A conjunction of `len` TRUE conditions.
    pub fn mk_true(len: usize) -> Result<Self, Error> {
        let seq = Self::blank(true, len)?;
        Ok(Self {
            empty: seq.mask,
            low: seq.mask,
            middle: seq.mask,
            high: seq.mask,
            ..seq
        })
    }

    /// A disjunction of `len` FALSE conditions.
    pub fn mk_false(len: usize) -> Result<Self, Error> {
        Self::blank(false, len)
    }

    fn mk_seq(is_and: bool, conds: &[CsCondition]) -> Result<Self, Error> {
        let mut seq = Self::blank(is_and, conds.len())?;
        for (i, &cond) in conds.iter().enumerate() {
            seq = seq.put(i, cond);
        }
        Ok(seq)
    }

    /// All positions FALSE.
    fn blank(is_and: bool, len: usize) -> Result<Self, Error> {
        if len > MAX_COUNTERS {
            return Err(Error::Capacity { requested: len });
        }
        Ok(Self {
            is_and,
            len: len as u8,
            mask: low_mask(len),
            empty: 0,
            low: 0,
            middle: 0,
            high: 0,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True for a conjunction, false for a disjunction.
    #[inline]
    pub fn is_and(&self) -> bool {
        self.is_and
    }

    #[inline]
    fn bits_at(&self, i: usize) -> u8 {
        let bit = 1u64 << i;
        let mut bits = 0;
        if self.low & bit != 0 {
            bits |= CsCondition::Low.bits();
        }
        if self.middle & bit != 0 {
            bits |= CsCondition::Middle.bits();
        }
        if self.high & bit != 0 {
            bits |= CsCondition::High.bits();
        }
        if self.empty & bit != 0 {
            bits |= CsCondition::Empty.bits();
        }
        bits
    }

    /// The condition at position `i`, or `None` past the end.
    #[inline]
    pub fn get(&self, i: usize) -> Option<CsCondition> {
        (i < self.len()).then(|| CsCondition::from_bits(self.bits_at(i)))
    }

    /// Overwrite position `i`; the caller guarantees `i < len`.
    fn put(self, i: usize, cond: CsCondition) -> Self {
        let bit = 1u64 << i;
        Self {
            empty: assign(self.empty, bit, cond.contains(CsCondition::Empty)),
            low: assign(self.low, bit, cond.contains(CsCondition::Low)),
            middle: assign(self.middle, bit, cond.contains(CsCondition::Middle)),
            high: assign(self.high, bit, cond.contains(CsCondition::High)),
            ..self
        }
    }

    fn check_index(&self, i: usize) -> Result<(), Error> {
        if i < self.len() {
            Ok(())
        } else {
            Err(Error::IndexOutOfRange {
                index: i,
                len: self.len(),
            })
        }
    }

    /// A copy with position `i` replaced by `cond`.
    pub fn update(&self, i: usize, cond: CsCondition) -> Result<Self, Error> {
        self.check_index(i)?;
        Ok(self.put(i, cond))
    }

    /// A copy with position `i` replaced by `self[i] | cond`.
    pub fn or_at(&self, i: usize, cond: CsCondition) -> Result<Self, Error> {
        self.check_index(i)?;
        Ok(self.put(i, self[i] | cond))
    }

    /// A copy with position `i` replaced by `self[i] & cond`.
    pub fn and_at(&self, i: usize, cond: CsCondition) -> Result<Self, Error> {
        self.check_index(i)?;
        Ok(self.put(i, self[i] & cond))
    }

    /// Position-wise intersection of two equally long sequences, read as a
    /// conjunction regardless of the operands' polarity.
    fn meet(&self, other: &Self) -> Self {
        debug_assert_eq!(self.len, other.len);
        Self {
            is_and: true,
            len: self.len,
            mask: self.mask,
            empty: self.empty & other.empty,
            low: self.low & other.low,
            middle: self.middle & other.middle,
            high: self.high & other.high,
        }
    }

    /// Conjunction: every position has at least one fact.
    /// Disjunction: some position has at least one fact.
    pub fn is_satisfiable(&self) -> bool {
        let any = self.empty | self.low | self.middle | self.high;
        if self.is_and {
            any == self.mask
        } else {
            any != 0
        }
    }

    /// Conjunction: every position is TRUE.
    /// Disjunction: some position is TRUE.
    pub fn is_valid(&self) -> bool {
        if self.is_and {
            self.empty == self.mask
                && self.low == self.mask
                && self.middle == self.mask
                && self.high == self.mask
        } else {
            self.empty & self.low & self.middle & self.high != 0
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = CsCondition> {
        let seq = *self;
        (0..seq.len()).map(move |i| seq[i])
    }

    pub fn to_vec(&self) -> Vec<CsCondition> {
        self.iter().collect()
    }
}

/// `seq[i]`: the condition at position `i`.
///
/// # Panics
///
/// Panics if `i >= seq.len()`.
impl Index<usize> for CsConditionSeq {
    type Output = CsCondition;

    #[inline]
    fn index(&self, i: usize) -> &CsCondition {
        assert!(
            i < self.len(),
            "condition index {} out of range for length {}",
            i,
            self.len()
        );
        &CONDITION_TABLE[self.bits_at(i) as usize]
    }
}

/// Conjunction of two conjunction sequences of equal length.
impl BitAnd for CsConditionSeq {
    type Output = Result<CsConditionSeq, Error>;

    fn bitand(self, rhs: CsConditionSeq) -> Self::Output {
        if self.len != rhs.len || !self.is_and || !rhs.is_and {
            return Err(Error::IncompatibleOperands(
                "& is only supported between conjunction sequences of equal length",
            ));
        }
        Ok(self.meet(&rhs))
    }
}

/// Disjunction of two disjunction sequences of equal length.
impl BitOr for CsConditionSeq {
    type Output = Result<CsConditionSeq, Error>;

    fn bitor(self, rhs: CsConditionSeq) -> Self::Output {
        if self.len != rhs.len || self.is_and || rhs.is_and {
            return Err(Error::IncompatibleOperands(
                "| is only supported between disjunction sequences of equal length",
            ));
        }
        Ok(CsConditionSeq {
            is_and: false,
            len: self.len,
            mask: self.mask,
            empty: self.empty | rhs.empty,
            low: self.low | rhs.low,
            middle: self.middle | rhs.middle,
            high: self.high | rhs.high,
        })
    }
}

/// De Morgan: flips the polarity and complements every position.
impl Not for CsConditionSeq {
    type Output = CsConditionSeq;

    fn not(self) -> CsConditionSeq {
        CsConditionSeq {
            is_and: !self.is_and,
            len: self.len,
            mask: self.mask,
            empty: self.mask & !self.empty,
            low: self.mask & !self.low,
            middle: self.mask & !self.middle,
            high: self.mask & !self.high,
        }
    }
}

impl fmt::Display for CsConditionSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (trivial, sep, none) = if self.is_and {
            (CsCondition::True, "&", "TRUE")
        } else {
            (CsCondition::False, "|", "FALSE")
        };
        let mut first = true;
        for (i, cond) in self.iter().enumerate() {
            if cond == trivial {
                continue;
            }
            if !first {
                f.write_str(sep)?;
            }
            write!(f, "{}({})", cond, i)?;
            first = false;
        }
        if first {
            f.write_str(none)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Counter updates
// ---------------------------------------------------------------------------

/// An update of the live value set of one counter: a subset of the
/// actions insert 0 (bit 1), insert 1 (bit 2) and increment every value
/// (bit 4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum CsUpdate {
    /// No update.
    Noop = 0,
    /// Insert 0.
    Set0 = 1,
    /// Insert 1.
    Set1 = 2,
    /// Insert 0 and 1.
    Set01 = 3,
    /// Increment all values.
    Incr = 4,
    /// Increment all values, then insert 0.
    Incr0 = 5,
    /// Increment all values, then insert 1.
    Incr1 = 6,
    /// Increment all values, then insert 0 and 1.
    Incr01 = 7,
}

static UPDATE_TABLE: [CsUpdate; 8] = CsUpdate::ALL;

impl CsUpdate {
    /// All 8 updates, indexed by their bit mask.
    pub const ALL: [CsUpdate; 8] = [
        CsUpdate::Noop,
        CsUpdate::Set0,
        CsUpdate::Set1,
        CsUpdate::Set01,
        CsUpdate::Incr,
        CsUpdate::Incr0,
        CsUpdate::Incr1,
        CsUpdate::Incr01,
    ];

    #[inline]
    pub fn bits(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        Self::ALL[(bits & 0x7) as usize]
    }

    /// True when every action of `other` is an action of `self`.
    #[inline]
    pub fn contains(self, other: CsUpdate) -> bool {
        self.bits() & other.bits() == other.bits()
    }

    pub fn name(self) -> &'static str {
        match self {
            CsUpdate::Noop => "NOOP",
            CsUpdate::Set0 => "SET0",
            CsUpdate::Set1 => "SET1",
            CsUpdate::Set01 => "SET01",
            CsUpdate::Incr => "INCR",
            CsUpdate::Incr0 => "INCR0",
            CsUpdate::Incr1 => "INCR1",
            CsUpdate::Incr01 => "INCR01",
        }
    }
}

impl BitOr for CsUpdate {
    type Output = CsUpdate;

    #[inline]
    fn bitor(self, rhs: CsUpdate) -> CsUpdate {
        CsUpdate::from_bits(self.bits() | rhs.bits())
    }
}

impl fmt::Display for CsUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A sequence of up to [`MAX_COUNTERS`] counter updates, stored as one
/// `u64` per action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CsUpdateSeq {
    len: u8,
    set0: u64,
    set1: u64,
    incr: u64,
}

impl CsUpdateSeq {
    /// `len` NOOP updates.
    pub fn mk_noop(len: usize) -> Result<Self, Error> {
        if len > MAX_COUNTERS {
            return Err(Error::Capacity { requested: len });
        }
        Ok(Self {
            len: len as u8,
            set0: 0,
            set1: 0,
            incr: 0,
        })
    }

    /// Pack a literal sequence of updates.
    pub fn mk(updates: &[CsUpdate]) -> Result<Self, Error> {
        let mut seq = Self::mk_noop(updates.len())?;
        for (i, &upd) in updates.iter().enumerate() {
            seq = seq.merge_at(i, upd);
        }
        Ok(seq)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn bits_at(&self, i: usize) -> u8 {
        let bit = 1u64 << i;
        let mut bits = 0;
        if self.set0 & bit != 0 {
            bits |= CsUpdate::Set0.bits();
        }
        if self.set1 & bit != 0 {
            bits |= CsUpdate::Set1.bits();
        }
        if self.incr & bit != 0 {
            bits |= CsUpdate::Incr.bits();
        }
        bits
    }

    #[inline]
    pub fn get(&self, i: usize) -> Option<CsUpdate> {
        (i < self.len()).then(|| CsUpdate::from_bits(self.bits_at(i)))
    }

    fn merge_at(self, i: usize, upd: CsUpdate) -> Self {
        let bit = 1u64 << i;
        let merged = upd | CsUpdate::from_bits(self.bits_at(i));
        Self {
            set0: assign(self.set0, bit, merged.contains(CsUpdate::Set0)),
            set1: assign(self.set1, bit, merged.contains(CsUpdate::Set1)),
            incr: assign(self.incr, bit, merged.contains(CsUpdate::Incr)),
            ..self
        }
    }

    /// A copy with position `i` replaced by `self[i] | upd`.
    pub fn or_at(&self, i: usize, upd: CsUpdate) -> Result<Self, Error> {
        if i >= self.len() {
            return Err(Error::IndexOutOfRange {
                index: i,
                len: self.len(),
            });
        }
        Ok(self.merge_at(i, upd))
    }

    /// True when every position is NOOP.
    #[inline]
    pub fn is_noop(&self) -> bool {
        self.set0 == 0 && self.set1 == 0 && self.incr == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = CsUpdate> {
        let seq = *self;
        (0..seq.len()).map(move |i| seq[i])
    }

    pub fn to_vec(&self) -> Vec<CsUpdate> {
        self.iter().collect()
    }
}

/// `seq[i]`: the update at position `i`.
///
/// # Panics
///
/// Panics if `i >= seq.len()`.
impl Index<usize> for CsUpdateSeq {
    type Output = CsUpdate;

    #[inline]
    fn index(&self, i: usize) -> &CsUpdate {
        assert!(
            i < self.len(),
            "update index {} out of range for length {}",
            i,
            self.len()
        );
        &UPDATE_TABLE[self.bits_at(i) as usize]
    }
}

/// Position-wise union of two sequences of equal length.
impl BitOr for CsUpdateSeq {
    type Output = Result<CsUpdateSeq, Error>;

    fn bitor(self, rhs: CsUpdateSeq) -> Self::Output {
        if self.len != rhs.len {
            return Err(Error::IncompatibleOperands(
                "| is only supported between update sequences of equal length",
            ));
        }
        Ok(CsUpdateSeq {
            len: self.len,
            set0: self.set0 | rhs.set0,
            set1: self.set1 | rhs.set1,
            incr: self.incr | rhs.incr,
        })
    }
}

impl fmt::Display for CsUpdateSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_noop() {
            return f.write_str("NOOP");
        }
        let mut first = true;
        for (i, upd) in self.iter().enumerate() {
            if upd == CsUpdate::Noop {
                continue;
            }
            if !first {
                f.write_str(";")?;
            }
            write!(f, "{}({})", upd, i)?;
            first = false;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Alphabet predicates
// ---------------------------------------------------------------------------

/// An effective boolean algebra over predicates on input symbols.
///
/// The construction is generic over this trait: the caller supplies the
/// alphabet algebra, and [`CsAlgebra`] lifts it to guards over (symbol,
/// counter conditions) pairs.
pub trait BooleanAlgebra {
    type Pred: Clone + Eq + std::hash::Hash + fmt::Debug;

    /// The predicate that holds for every symbol.
    fn top(&self) -> Self::Pred;
    /// The predicate that holds for no symbol.
    fn bottom(&self) -> Self::Pred;
    fn and(&self, a: &Self::Pred, b: &Self::Pred) -> Self::Pred;
    fn or(&self, a: &Self::Pred, b: &Self::Pred) -> Self::Pred;
    fn not(&self, a: &Self::Pred) -> Self::Pred;
    fn is_satisfiable(&self, a: &Self::Pred) -> bool;
    /// A short textual form for diagnostics.
    fn pretty_print(&self, a: &Self::Pred) -> String;
}

/// Shorthand for the predicate type of an algebra.
pub type PredOf<A> = <A as BooleanAlgebra>::Pred;

/// A 256-entry boolean lookup table indicating which byte values belong
/// to a character class.  `class[b]` is `true` when byte `b` matches.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteClass([bool; 256]);

impl ByteClass {
    /// A class that matches every byte value (equivalent to `(?s-u:.)`).
    pub const ALL: Self = Self([true; 256]);

    /// A class that matches no byte value.
    pub const NONE: Self = Self([false; 256]);

    pub fn byte(b: u8) -> Self {
        let mut table = Self::NONE;
        table.0[b as usize] = true;
        table
    }

    /// The inclusive range `start..=end`.
    pub fn range(start: u8, end: u8) -> Self {
        let mut table = Self::NONE;
        for b in start..=end {
            table.0[b as usize] = true;
        }
        table
    }

    pub fn from_bytes(bytes: impl IntoIterator<Item = u8>) -> Self {
        let mut table = Self::NONE;
        for b in bytes {
            table.0[b as usize] = true;
        }
        table
    }

    /// Parse a single byte class written in regex syntax, e.g. `a`,
    /// `[a-z0-9]`, `[^\n]` or `.`.
    ///
    /// The pattern is parsed with Unicode disabled and `.` matching every
    /// byte.  Anything that is not a single class or a single byte literal
    /// is rejected with [`Error::NotAClass`].
    pub fn parse(pattern: &str) -> Result<Self, Error> {
        let hir = regex_syntax::ParserBuilder::new()
            .unicode(false)
            .utf8(false)
            .dot_matches_new_line(true)
            .build()
            .parse(pattern)?;
        match hir.kind() {
            HirKind::Class(class) => Self::from_hir_class(class),
            HirKind::Literal(lit) if lit.0.len() == 1 => Ok(Self::byte(lit.0[0])),
            _ => Err(Error::NotAClass(pattern.to_string())),
        }
    }

    /// Lower a `regex-syntax` class to a byte table.
    pub fn from_hir_class(class: &hir::Class) -> Result<Self, Error> {
        match class {
            hir::Class::Bytes(class) => {
                let mut table = Self::NONE;
                for range in class.ranges() {
                    for b in range.start()..=range.end() {
                        table.0[b as usize] = true;
                    }
                }
                Ok(table)
            }
            hir::Class::Unicode(class) => {
                // Only classes handed in directly are Unicode: `parse`
                // disables Unicode.  A codepoint up to U+00FF is read as
                // the byte of the same value.
                let mut table = Self::NONE;
                for range in class.ranges() {
                    let (start, end) = (u32::from(range.start()), u32::from(range.end()));
                    if end > 0xFF {
                        return Err(Error::UnsupportedClass(hir::Class::Unicode(class.clone())));
                    }
                    for b in start..=end {
                        table.0[b as usize] = true;
                    }
                }
                Ok(table)
            }
        }
    }

    #[inline]
    pub fn contains(&self, b: u8) -> bool {
        self.0[b as usize]
    }

    /// Number of bytes in the class.
    pub fn len(&self) -> usize {
        self.0.iter().filter(|&&b| b).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.0.iter().any(|&b| b)
    }

    /// Maximal runs of member bytes, in ascending order.
    fn ranges(&self) -> Vec<(u8, u8)> {
        let mut ranges = Vec::new();
        let mut start: Option<u8> = None;
        for b in 0..=255u8 {
            match (self.0[b as usize], start) {
                (true, None) => start = Some(b),
                (false, Some(s)) => {
                    ranges.push((s, b - 1));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            ranges.push((s, 255));
        }
        ranges
    }

    fn zip_with(&self, other: &Self, op: impl Fn(bool, bool) -> bool) -> Self {
        let mut table = Self::NONE;
        for (i, slot) in table.0.iter_mut().enumerate() {
            *slot = op(self.0[i], other.0[i]);
        }
        table
    }
}

/// `class[byte]`: test whether a byte matches this class.
impl Index<u8> for ByteClass {
    type Output = bool;

    #[inline]
    fn index(&self, byte: u8) -> &bool {
        &self.0[byte as usize]
    }
}

fn write_class_byte(f: &mut fmt::Formatter<'_>, b: u8) -> fmt::Result {
    if b.is_ascii_alphanumeric() || b == b'_' {
        write!(f, "{}", b as char)
    } else {
        write!(f, "\\x{:02X}", b)
    }
}

/// Regex-like class syntax: `.`, `a`, `[a-cx]`, `[]` for the empty class.
impl fmt::Display for ByteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges = self.ranges();
        match ranges.as_slice() {
            [(0, 255)] => f.write_str("."),
            [(lo, hi)] if lo == hi => write_class_byte(f, *lo),
            _ => {
                f.write_str("[")?;
                for &(lo, hi) in &ranges {
                    write_class_byte(f, lo)?;
                    if hi > lo {
                        if hi > lo + 1 {
                            f.write_str("-")?;
                        }
                        write_class_byte(f, hi)?;
                    }
                }
                f.write_str("]")
            }
        }
    }
}

impl fmt::Debug for ByteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteClass({})", self)
    }
}

/// The boolean algebra of [`ByteClass`] predicates over the byte alphabet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteAlgebra;

impl BooleanAlgebra for ByteAlgebra {
    type Pred = ByteClass;

    fn top(&self) -> ByteClass {
        ByteClass::ALL
    }

    fn bottom(&self) -> ByteClass {
        ByteClass::NONE
    }

    fn and(&self, a: &ByteClass, b: &ByteClass) -> ByteClass {
        a.zip_with(b, |x, y| x && y)
    }

    fn or(&self, a: &ByteClass, b: &ByteClass) -> ByteClass {
        a.zip_with(b, |x, y| x || y)
    }

    fn not(&self, a: &ByteClass) -> ByteClass {
        a.zip_with(&ByteClass::ALL, |x, _| !x)
    }

    fn is_satisfiable(&self, a: &ByteClass) -> bool {
        !a.is_empty()
    }

    fn pretty_print(&self, a: &ByteClass) -> String {
        a.to_string()
    }
}

// ---------------------------------------------------------------------------
// Guards: alphabet predicates combined with counter conditions
// ---------------------------------------------------------------------------

/// A transition guard over (input symbol, counter conditions) pairs.
///
/// Stored as a disjoint sum of products: every product pairs an alphabet
/// predicate with a *conjunctive* condition sequence, no two products
/// overlap, every product is satisfiable, and no two products share the
/// same condition sequence.  The empty sum is the unsatisfiable guard.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CsPred<P> {
    products: Vec<(P, CsConditionSeq)>,
}

impl<P> CsPred<P> {
    /// The disjoint products of this guard.
    pub fn products(&self) -> &[(P, CsConditionSeq)] {
        &self.products
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    /// True for the unsatisfiable guard.
    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

/// The product algebra of an alphabet algebra `A` and the condition
/// sequences over a fixed number of counters.
#[derive(Clone, Debug)]
pub struct CsAlgebra<A> {
    alphabet: A,
    true_seq: CsConditionSeq,
}

impl<A: BooleanAlgebra> CsAlgebra<A> {
    /// Fails with [`Error::Capacity`] above [`MAX_COUNTERS`] counters.
    pub fn new(alphabet: A, counters: usize) -> Result<Self, Error> {
        let true_seq = CsConditionSeq::mk_true(counters)?;
        Ok(Self { alphabet, true_seq })
    }

    pub fn alphabet(&self) -> &A {
        &self.alphabet
    }

    pub fn nr_of_counters(&self) -> usize {
        self.true_seq.len()
    }

    /// The conjunction of TRUE over all counters.
    pub fn true_condition(&self) -> CsConditionSeq {
        self.true_seq
    }

    /// Compose an alphabet predicate with a condition sequence.
    ///
    /// A disjunctive sequence is split into disjoint conjunctive products
    /// first: position `i` holds and no earlier position does.
    pub fn mk_predicate(
        &self,
        pred: &A::Pred,
        cond: &CsConditionSeq,
    ) -> Result<CsPred<A::Pred>, Error> {
        if cond.len() != self.nr_of_counters() {
            return Err(Error::IncompatibleOperands(
                "condition sequence length differs from the number of counters",
            ));
        }
        let products = if cond.is_and() {
            vec![(pred.clone(), *cond)]
        } else {
            self.split_disjunction(cond)
                .into_iter()
                .map(|c| (pred.clone(), c))
                .collect()
        };
        Ok(self.normalize(products))
    }

    /// Decompose a guard into its disjoint (predicate, conjunction) pairs.
    pub fn sum_of_products(&self, guard: &CsPred<A::Pred>) -> Vec<(A::Pred, CsConditionSeq)> {
        guard.products.clone()
    }

    /// For every product: the alphabet text, then `/` and the condition
    /// unless it is TRUE everywhere.
    pub fn describe_guard(&self, guard: &CsPred<A::Pred>) -> String {
        let mut s = String::new();
        for (pred, cond) in &guard.products {
            s.push_str(&self.alphabet.pretty_print(pred));
            if !cond.is_valid() {
                s.push('/');
                s.push_str(&cond.to_string());
            }
        }
        s
    }

    fn product_is_satisfiable(&self, pred: &A::Pred, cond: &CsConditionSeq) -> bool {
        cond.is_satisfiable() && self.alphabet.is_satisfiable(pred)
    }

    /// Drop unsatisfiable products and merge products with equal
    /// conditions.  Merging keeps the sum disjoint.
    fn normalize(&self, products: Vec<(A::Pred, CsConditionSeq)>) -> CsPred<A::Pred> {
        let mut merged: IndexMap<CsConditionSeq, A::Pred> = IndexMap::new();
        for (pred, cond) in products {
            if !self.product_is_satisfiable(&pred, &cond) {
                continue;
            }
            match merged.entry(cond) {
                Entry::Occupied(mut e) => {
                    let joined = self.alphabet.or(e.get(), &pred);
                    *e.get_mut() = joined;
                }
                Entry::Vacant(e) => {
                    e.insert(pred);
                }
            }
        }
        CsPred {
            products: merged.into_iter().map(|(cond, pred)| (pred, cond)).collect(),
        }
    }

    /// Pairwise intersection of two sums of products.
    fn intersect(
        &self,
        a: &[(A::Pred, CsConditionSeq)],
        b: &[(A::Pred, CsConditionSeq)],
    ) -> Vec<(A::Pred, CsConditionSeq)> {
        let mut out = Vec::new();
        for (p1, c1) in a {
            for (p2, c2) in b {
                let cond = c1.meet(c2);
                if !cond.is_satisfiable() {
                    continue;
                }
                let pred = self.alphabet.and(p1, p2);
                if self.alphabet.is_satisfiable(&pred) {
                    out.push((pred, cond));
                }
            }
        }
        out
    }

    /// The complement of a conjunction as disjoint conjunctions: the `i`th
    /// product keeps positions before `i`, negates position `i` and leaves
    /// the rest TRUE.
    fn complement_conjunction(&self, cond: &CsConditionSeq) -> Vec<CsConditionSeq> {
        let mut out = Vec::new();
        let mut prefix = self.true_seq;
        for (i, c) in cond.iter().enumerate() {
            if c != CsCondition::True {
                out.push(prefix.put(i, !c));
            }
            if c == CsCondition::False {
                break;
            }
            prefix = prefix.put(i, c);
        }
        out
    }

    /// A disjunction as disjoint conjunctions: the `i`th product requires
    /// position `i` and the negation of every earlier position.
    fn split_disjunction(&self, cond: &CsConditionSeq) -> Vec<CsConditionSeq> {
        let mut out = Vec::new();
        let mut prefix = self.true_seq;
        for (i, c) in cond.iter().enumerate() {
            if c != CsCondition::False {
                out.push(prefix.put(i, c));
            }
            if c == CsCondition::True {
                break;
            }
            prefix = prefix.put(i, !c);
        }
        out
    }
}

impl<A: BooleanAlgebra> BooleanAlgebra for CsAlgebra<A> {
    type Pred = CsPred<A::Pred>;

    fn top(&self) -> Self::Pred {
        self.normalize(vec![(self.alphabet.top(), self.true_seq)])
    }

    fn bottom(&self) -> Self::Pred {
        CsPred {
            products: Vec::new(),
        }
    }

    fn and(&self, a: &Self::Pred, b: &Self::Pred) -> Self::Pred {
        self.normalize(self.intersect(&a.products, &b.products))
    }

    fn or(&self, a: &Self::Pred, b: &Self::Pred) -> Self::Pred {
        let mut products = a.products.clone();
        if self.intersect(&a.products, &b.products).is_empty() {
            products.extend(b.products.iter().cloned());
        } else {
            let rest = self.not(a);
            products.extend(self.intersect(&b.products, &rest.products));
        }
        self.normalize(products)
    }

    fn not(&self, a: &Self::Pred) -> Self::Pred {
        let mut acc = vec![(self.alphabet.top(), self.true_seq)];
        for (pred, cond) in &a.products {
            let mut complement = vec![(self.alphabet.not(pred), self.true_seq)];
            complement.extend(
                self.complement_conjunction(cond)
                    .into_iter()
                    .map(|c| (pred.clone(), c)),
            );
            acc = self.intersect(&acc, &complement);
            if acc.is_empty() {
                break;
            }
        }
        self.normalize(acc)
    }

    fn is_satisfiable(&self, a: &Self::Pred) -> bool {
        !a.products.is_empty()
    }

    fn pretty_print(&self, a: &Self::Pred) -> String {
        self.describe_guard(a)
    }
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// A label of a counting-set automaton.
///
/// A *transition* label carries a guard and the counter updates applied
/// when the guard holds for the consumed symbol and the current counter
/// conditions.  A *final condition* carries only a guard, evaluated when
/// the input ends.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CsLabel<P> {
    guard: CsPred<P>,
    updates: Option<CsUpdateSeq>,
}

impl<P> CsLabel<P> {
    pub fn mk_final_condition(guard: CsPred<P>) -> Self {
        Self {
            guard,
            updates: None,
        }
    }

    pub fn mk_transition_label(guard: CsPred<P>, updates: CsUpdateSeq) -> Self {
        Self {
            guard,
            updates: Some(updates),
        }
    }

    pub fn is_final_condition(&self) -> bool {
        self.updates.is_none()
    }

    pub fn guard(&self) -> &CsPred<P> {
        &self.guard
    }

    /// `None` for a final condition.
    pub fn updates(&self) -> Option<&CsUpdateSeq> {
        self.updates.as_ref()
    }

    /// Diagnostic text, e.g. `a/LOW(0):INCR(c0)`.
    ///
    /// The guard part is rendered by [`CsAlgebra::describe_guard`]; a
    /// transition label appends `:` and its non-NOOP updates as
    /// `NAME(cK)` joined by `;`, unless every update is NOOP.
    pub fn describe<A>(&self, algebra: &CsAlgebra<A>) -> String
    where
        A: BooleanAlgebra<Pred = P>,
    {
        let mut s = algebra.describe_guard(&self.guard);
        if let Some(updates) = &self.updates {
            if !updates.is_noop() {
                s.push(':');
                let parts: Vec<String> = updates
                    .iter()
                    .enumerate()
                    .filter(|(_, upd)| *upd != CsUpdate::Noop)
                    .map(|(i, upd)| format!("{}(c{})", upd, i))
                    .collect();
                s.push_str(&parts.join(";"));
            }
        }
        s
    }
}

// ---------------------------------------------------------------------------
// Automata and determinization
// ---------------------------------------------------------------------------

/// A labeled transition `source -> target`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Move<L> {
    pub source: StateIdx,
    pub target: StateIdx,
    pub label: L,
}

impl<L> Move<L> {
    pub fn new(source: StateIdx, target: StateIdx, label: L) -> Self {
        Self {
            source,
            target,
            label,
        }
    }
}

/// A labeled transition graph with an initial state and final states.
///
/// The state set is the initial state, the final states and every move
/// endpoint.
#[derive(Clone, Debug)]
pub struct Automaton<L> {
    initial: StateIdx,
    finals: BTreeSet<StateIdx>,
    states: BTreeSet<StateIdx>,
    moves: Vec<Move<L>>,
    /// Outgoing move indices (into `moves`) per source state.
    delta: BTreeMap<StateIdx, Vec<usize>>,
}

impl<L> Automaton<L> {
    pub fn new(
        initial: StateIdx,
        finals: impl IntoIterator<Item = StateIdx>,
        moves: Vec<Move<L>>,
    ) -> Self {
        let finals: BTreeSet<StateIdx> = finals.into_iter().collect();
        let mut states = BTreeSet::from([initial]);
        states.extend(finals.iter().copied());
        let mut delta: BTreeMap<StateIdx, Vec<usize>> = BTreeMap::new();
        for (i, m) in moves.iter().enumerate() {
            states.insert(m.source);
            states.insert(m.target);
            delta.entry(m.source).or_default().push(i);
        }
        Self {
            initial,
            finals,
            states,
            moves,
            delta,
        }
    }

    pub fn initial_state(&self) -> StateIdx {
        self.initial
    }

    pub fn is_final_state(&self, state: StateIdx) -> bool {
        self.finals.contains(&state)
    }

    pub fn final_states(&self) -> &BTreeSet<StateIdx> {
        &self.finals
    }

    /// All states in ascending order.
    pub fn states(&self) -> impl Iterator<Item = StateIdx> + '_ {
        self.states.iter().copied()
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn moves(&self) -> &[Move<L>] {
        &self.moves
    }

    /// Moves leaving `state`, in insertion order.
    pub fn moves_from(&self, state: StateIdx) -> impl Iterator<Item = &Move<L>> + '_ {
        self.delta
            .get(&state)
            .into_iter()
            .flatten()
            .map(move |&i| &self.moves[i])
    }
}

/// Maps every state of a determinized automaton to the set of original
/// states it stands for.
///
/// Sets are interned in an [`IndexSet`]; the index of a set is the id of
/// the determinized state, so ids are dense and assigned in discovery
/// order.
#[derive(Clone, Debug, Default)]
pub struct PowerSetStateBuilder {
    sets: IndexSet<BTreeSet<StateIdx>>,
}

impl PowerSetStateBuilder {
    /// Return the state standing for `members`, creating it if needed.
    /// The flag is true when the state is new.
    pub fn intern(&mut self, members: BTreeSet<StateIdx>) -> (StateIdx, bool) {
        let (idx, is_new) = self.sets.insert_full(members);
        (StateIdx(idx), is_new)
    }

    /// The original states of `state`, in ascending order; empty for an
    /// unknown state.
    pub fn members(&self, state: StateIdx) -> impl Iterator<Item = StateIdx> + '_ {
        self.sets
            .get_index(state.idx())
            .into_iter()
            .flatten()
            .copied()
    }

    pub fn member_set(&self, state: StateIdx) -> Option<&BTreeSet<StateIdx>> {
        self.sets.get_index(state.idx())
    }

    /// The smallest original state of `state`.
    pub fn first_member(&self, state: StateIdx) -> Result<StateIdx, Error> {
        self.members(state).next().ok_or(Error::EmptyState(state))
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// The satisfiable regions of `within` cut by the boolean combinations of
/// `guards`.
///
/// Each region comes with one flag per guard telling whether the region
/// lies inside it.  Regions are pairwise disjoint and cover `within`.
fn minterms<A: BooleanAlgebra>(
    algebra: &A,
    within: A::Pred,
    guards: &[&A::Pred],
) -> Vec<(A::Pred, Vec<bool>)> {
    if !algebra.is_satisfiable(&within) {
        return Vec::new();
    }
    let mut regions = vec![(within, Vec::with_capacity(guards.len()))];
    for &guard in guards {
        let negated = algebra.not(guard);
        let mut next = Vec::with_capacity(regions.len() * 2);
        for (region, inside) in regions {
            let pos = algebra.and(&region, guard);
            if algebra.is_satisfiable(&pos) {
                let mut flags = inside.clone();
                flags.push(true);
                next.push((pos, flags));
            }
            let neg = algebra.and(&region, &negated);
            if algebra.is_satisfiable(&neg) {
                let mut flags = inside;
                flags.push(false);
                next.push((neg, flags));
            }
        }
        regions = next;
    }
    regions
}

/// Symbolic subset construction.
///
/// Returns the deterministic automaton and the builder mapping each of its
/// states to the original states it stands for.  Guards of moves between
/// the same pair of states are merged with [`BooleanAlgebra::or`].
pub fn determinize<A: BooleanAlgebra>(
    aut: &Automaton<A::Pred>,
    algebra: &A,
) -> (Automaton<A::Pred>, PowerSetStateBuilder) {
    let mut builder = PowerSetStateBuilder::default();
    let (initial, _) = builder.intern(BTreeSet::from([aut.initial_state()]));
    let mut worklist = VecDeque::from([initial]);
    let mut moves = Vec::new();

    while let Some(source) = worklist.pop_front() {
        let members: Vec<StateIdx> = builder.members(source).collect();
        let outgoing: Vec<&Move<A::Pred>> = members
            .iter()
            .flat_map(|&q| aut.moves_from(q))
            .collect();
        let guards: Vec<&A::Pred> = outgoing.iter().map(|m| &m.label).collect();

        let mut targets: IndexMap<BTreeSet<StateIdx>, A::Pred> = IndexMap::new();
        for (region, inside) in minterms(algebra, algebra.top(), &guards) {
            let set: BTreeSet<StateIdx> = outgoing
                .iter()
                .zip(&inside)
                .filter(|(_, hit)| **hit)
                .map(|(m, _)| m.target)
                .collect();
            if set.is_empty() {
                continue;
            }
            match targets.entry(set) {
                Entry::Occupied(mut e) => {
                    let joined = algebra.or(e.get(), &region);
                    *e.get_mut() = joined;
                }
                Entry::Vacant(e) => {
                    e.insert(region);
                }
            }
        }

        for (set, guard) in targets {
            let (target, is_new) = builder.intern(set);
            if is_new {
                worklist.push_back(target);
            }
            moves.push(Move::new(source, target, guard));
        }
    }

    let finals: Vec<StateIdx> = (0..builder.len())
        .map(StateIdx)
        .filter(|&d| builder.members(d).any(|q| aut.is_final_state(q)))
        .collect();
    (Automaton::new(initial, finals, moves), builder)
}

// ---------------------------------------------------------------------------
// Counting automata
// ---------------------------------------------------------------------------

/// The counter operation carried by a counting-automaton move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CounterOp {
    Noop,
    /// Enter a counting state with the counter at 0.
    Set0,
    /// Enter a counting state with the counter at 1.
    Set1,
    /// Loop on a counting state.
    Incr,
    /// Leave a counting state.
    Exit,
    /// Leave a counting state and enter another one at 0.
    ExitSet0,
    /// Leave a counting state and enter another one at 1.
    ExitSet1,
}

impl CounterOp {
    pub fn is_exit(self) -> bool {
        matches!(self, CounterOp::Exit | CounterOp::ExitSet0 | CounterOp::ExitSet1)
    }
}

impl fmt::Display for CounterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CounterOp::Noop => "NOOP",
            CounterOp::Set0 => "SET0",
            CounterOp::Set1 => "SET1",
            CounterOp::Incr => "INCR",
            CounterOp::Exit => "EXIT",
            CounterOp::ExitSet0 => "EXIT_SET0",
            CounterOp::ExitSet1 => "EXIT_SET1",
        })
    }
}

/// A bounded counter `[lower, upper]` attached to a counting state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Counter {
    id: usize,
    lower: u32,
    upper: u32,
}

impl Counter {
    pub fn new(id: usize, lower: u32, upper: u32) -> Result<Self, Error> {
        if lower > upper {
            return Err(Error::InvalidBounds { lower, upper });
        }
        Ok(Self { id, lower, upper })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn lower_bound(&self) -> u32 {
        self.lower
    }

    pub fn upper_bound(&self) -> u32 {
        self.upper
    }
}

/// The label of a counting-automaton move.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CaLabel<P> {
    pub pred: P,
    pub op: CounterOp,
}

/// A (possibly nondeterministic) counting automaton, the input of
/// [`CsAutomaton::create_from`].
pub trait CountingAutomaton {
    type Alphabet: BooleanAlgebra;

    fn alphabet(&self) -> &Self::Alphabet;

    fn initial_state(&self) -> StateIdx;

    fn final_states(&self) -> &BTreeSet<StateIdx>;

    fn moves(&self) -> &[Move<CaLabel<PredOf<Self::Alphabet>>>];

    /// The counter of `state`, if it is a counting state.
    fn counter_of(&self, state: StateIdx) -> Option<&Counter>;

    /// All counters, indexed by id.
    fn counters(&self) -> &[Counter];

    fn nr_of_counters(&self) -> usize {
        self.counters().len()
    }

    fn is_counting_state(&self, state: StateIdx) -> bool {
        self.counter_of(state).is_some()
    }

    /// The counter updates performed by the moves leaving `state` on the
    /// symbols of `pred` when the counters satisfy `cond`.
    ///
    /// `cond` is a conjunction over all counters and `pred` a minterm of
    /// the determinized guard, so every move either fully covers `pred` or
    /// is disjoint from it.
    fn counter_update(
        &self,
        state: StateIdx,
        cond: &CsConditionSeq,
        pred: &PredOf<Self::Alphabet>,
    ) -> Result<CsUpdateSeq, Error>;
}

/// A counting automaton stored as a move list.
#[derive(Clone, Debug)]
pub struct CountingNfa<A: BooleanAlgebra> {
    alphabet: A,
    initial: StateIdx,
    finals: BTreeSet<StateIdx>,
    moves: Vec<Move<CaLabel<A::Pred>>>,
    counting: BTreeMap<StateIdx, Counter>,
    counters: Vec<Counter>,
}

impl<A: BooleanAlgebra> CountingNfa<A> {
    pub fn builder(alphabet: A, initial: StateIdx) -> CountingNfaBuilder<A> {
        CountingNfaBuilder::new(alphabet, initial)
    }
}

impl<A: BooleanAlgebra> CountingAutomaton for CountingNfa<A> {
    type Alphabet = A;

    fn alphabet(&self) -> &A {
        &self.alphabet
    }

    fn initial_state(&self) -> StateIdx {
        self.initial
    }

    fn final_states(&self) -> &BTreeSet<StateIdx> {
        &self.finals
    }

    fn moves(&self) -> &[Move<CaLabel<A::Pred>>] {
        &self.moves
    }

    fn counter_of(&self, state: StateIdx) -> Option<&Counter> {
        self.counting.get(&state)
    }

    fn counters(&self) -> &[Counter] {
        &self.counters
    }

    fn counter_update(
        &self,
        state: StateIdx,
        cond: &CsConditionSeq,
        pred: &A::Pred,
    ) -> Result<CsUpdateSeq, Error> {
        let mut upd = CsUpdateSeq::mk_noop(self.counters.len())?;
        let source = self.counter_of(state);
        for m in self.moves.iter().filter(|m| m.source == state) {
            let overlap = self.alphabet.and(&m.label.pred, pred);
            if !self.alphabet.is_satisfiable(&overlap) {
                continue;
            }
            let entered = self.counter_of(m.target).map(Counter::id);
            match source {
                Some(counter) => {
                    let c = counter.id();
                    let here = cond.get(c).unwrap_or(CsCondition::True);
                    match m.label.op {
                        CounterOp::Incr => {
                            if here.intersects(CsCondition::CanLoop) {
                                upd = upd.or_at(c, CsUpdate::Incr)?;
                            }
                        }
                        CounterOp::Exit => {}
                        CounterOp::ExitSet0 | CounterOp::ExitSet1 => {
                            let action = if m.label.op == CounterOp::ExitSet0 {
                                CsUpdate::Set0
                            } else {
                                CsUpdate::Set1
                            };
                            match entered {
                                Some(d) if here.intersects(CsCondition::CanExit) => {
                                    upd = upd.or_at(d, action)?;
                                }
                                _ => {}
                            }
                        }
                        op => return Err(Error::UnexpectedCounterOp { state, op }),
                    }
                }
                None => match (m.label.op, entered) {
                    (CounterOp::Set0, Some(d)) => upd = upd.or_at(d, CsUpdate::Set0)?,
                    // Entering a counter from outside completes its first
                    // iteration.
                    (CounterOp::Set1 | CounterOp::Incr, Some(d)) => {
                        upd = upd.or_at(d, CsUpdate::Set1)?
                    }
                    _ => {}
                },
            }
        }
        Ok(upd)
    }
}

/// Incremental construction of a [`CountingNfa`].
///
/// ```
/// use counting_set_automaton::*;
///
/// let a = ByteClass::parse("a")?;
/// let mut b = CountingNfa::builder(ByteAlgebra, StateIdx(0));
/// b.add_counter(StateIdx(1), 2, 3)?;
/// b.add_move(StateIdx(0), StateIdx(1), a, CounterOp::Incr)
///     .add_move(StateIdx(1), StateIdx(1), a, CounterOp::Incr)
///     .add_move(StateIdx(1), StateIdx(2), a, CounterOp::Exit)
///     .add_final(StateIdx(2));
/// let ca = b.build();
/// assert_eq!(ca.nr_of_counters(), 1);
/// # Ok::<(), counting_set_automaton::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct CountingNfaBuilder<A: BooleanAlgebra> {
    nfa: CountingNfa<A>,
}

impl<A: BooleanAlgebra> CountingNfaBuilder<A> {
    pub fn new(alphabet: A, initial: StateIdx) -> Self {
        Self {
            nfa: CountingNfa {
                alphabet,
                initial,
                finals: BTreeSet::new(),
                moves: Vec::new(),
                counting: BTreeMap::new(),
                counters: Vec::new(),
            },
        }
    }

    /// Make `state` a counting state with a fresh counter `[lower, upper]`.
    /// Counter ids are assigned densely from 0.
    pub fn add_counter(&mut self, state: StateIdx, lower: u32, upper: u32) -> Result<usize, Error> {
        if self.nfa.counting.contains_key(&state) {
            return Err(Error::DuplicateCounter(state));
        }
        let id = self.nfa.counters.len();
        if id >= MAX_COUNTERS {
            return Err(Error::Capacity { requested: id + 1 });
        }
        let counter = Counter::new(id, lower, upper)?;
        self.nfa.counters.push(counter);
        self.nfa.counting.insert(state, counter);
        Ok(id)
    }

    pub fn add_move(
        &mut self,
        source: StateIdx,
        target: StateIdx,
        pred: A::Pred,
        op: CounterOp,
    ) -> &mut Self {
        self.nfa
            .moves
            .push(Move::new(source, target, CaLabel { pred, op }));
        self
    }

    pub fn add_final(&mut self, state: StateIdx) -> &mut Self {
        self.nfa.finals.insert(state);
        self
    }

    pub fn build(self) -> CountingNfa<A> {
        self.nfa
    }
}

// ---------------------------------------------------------------------------
// Counting-set automata
// ---------------------------------------------------------------------------

/// Options for the diagnostic renderers of a [`CsAutomaton`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderOptions {
    name: String,
    show_powersets: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            name: "CsAutomaton".to_string(),
            show_powersets: true,
        }
    }
}

impl RenderOptions {
    /// The Graphviz graph name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Whether state descriptions list the original member states.
    pub fn show_powersets(mut self, yes: bool) -> Self {
        self.show_powersets = yes;
        self
    }
}

/// Quote `text` for a Graphviz string literal.
fn escape_dot(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// A deterministic counting-set automaton.
///
/// Every state stands for a set of states of the counting automaton it was
/// built from, and every counter active in a state holds the set of values
/// reachable along the runs merged into that state.  Transitions are
/// guarded by an alphabet predicate and a conjunction of counter
/// conditions, and update the counter sets when taken.
///
/// Built once by [`CsAutomaton::create_from`]; read-only afterwards.
#[derive(Clone, Debug)]
pub struct CsAutomaton<A: BooleanAlgebra> {
    algebra: CsAlgebra<A>,
    automaton: Automaton<CsLabel<A::Pred>>,
    state_builder: PowerSetStateBuilder,
    /// Counters of the counting members, indexed by state id.
    active_counters: Vec<BTreeSet<usize>>,
    final_counters: BTreeSet<usize>,
    counters: Box<[Counter]>,
    final_conditions: BTreeMap<StateIdx, CsLabel<A::Pred>>,
}

impl<A: BooleanAlgebra + Clone> CsAutomaton<A> {
    /// Build the counting-set automaton of a counting automaton.
    pub fn create_from<C>(ca: &C) -> Result<Self, Error>
    where
        C: CountingAutomaton<Alphabet = A>,
    {
        let nr_of_counters = ca.nr_of_counters();
        let algebra = CsAlgebra::new(ca.alphabet().clone(), nr_of_counters)?;
        let true_cond = algebra.true_condition();

        let mut product_moves = Vec::with_capacity(ca.moves().len());
        for m in ca.moves() {
            let mut cond = true_cond;
            if let Some(counter) = ca.counter_of(m.source) {
                let required = match m.label.op {
                    CounterOp::Incr => CsCondition::CanLoop,
                    op if op.is_exit() => CsCondition::CanExit,
                    op => {
                        return Err(Error::UnexpectedCounterOp {
                            state: m.source,
                            op,
                        })
                    }
                };
                cond = cond.and_at(counter.id(), required)?;
            }
            let guard = algebra.mk_predicate(&m.label.pred, &cond)?;
            product_moves.push(Move::new(m.source, m.target, guard));
        }
        let product = Automaton::new(
            ca.initial_state(),
            ca.final_states().iter().copied(),
            product_moves,
        );
        tracing::debug!(
            states = product.state_count(),
            moves = product.moves().len(),
            counters = nr_of_counters,
            "built product automaton"
        );

        let (det, state_builder) = determinize(&product, &algebra);
        state_builder.first_member(det.initial_state())?;
        tracing::debug!(
            states = det.state_count(),
            moves = det.moves().len(),
            "determinized product automaton"
        );

        let mut moves = Vec::new();
        for m in det.moves() {
            let members: Vec<StateIdx> = state_builder.members(m.source).collect();
            let symbols: Vec<&A::Pred> = ca
                .moves()
                .iter()
                .filter(|cm| members.contains(&cm.source))
                .map(|cm| &cm.label.pred)
                .collect();
            for (pred, cond) in algebra.sum_of_products(&m.label) {
                // A product may span symbols with different counter effects:
                // synthesize per alphabet minterm, then regroup by update.
                let mut by_update: IndexMap<CsUpdateSeq, A::Pred> = IndexMap::new();
                for (region, _) in minterms(algebra.alphabet(), pred, &symbols) {
                    let mut upd = CsUpdateSeq::mk_noop(nr_of_counters)?;
                    for &q in &members {
                        upd = (upd | ca.counter_update(q, &cond, &region)?)?;
                    }
                    match by_update.entry(upd) {
                        Entry::Occupied(mut e) => {
                            let joined = algebra.alphabet().or(e.get(), &region);
                            *e.get_mut() = joined;
                        }
                        Entry::Vacant(e) => {
                            e.insert(region);
                        }
                    }
                }
                for (upd, pred) in by_update {
                    let guard = algebra.mk_predicate(&pred, &cond)?;
                    let label = CsLabel::mk_transition_label(guard, upd);
                    tracing::trace!(
                        source = m.source.idx(),
                        target = m.target.idx(),
                        label = %label.describe(&algebra),
                        "synthesized transition"
                    );
                    moves.push(Move::new(m.source, m.target, label));
                }
            }
        }
        let automaton = Automaton::new(
            det.initial_state(),
            det.final_states().iter().copied(),
            moves,
        );

        let mut active_counters = Vec::with_capacity(state_builder.len());
        let mut final_counters = BTreeSet::new();
        for d in (0..state_builder.len()).map(StateIdx) {
            let mut active = BTreeSet::new();
            for q in state_builder.members(d) {
                if let Some(counter) = ca.counter_of(q) {
                    active.insert(counter.id());
                    if ca.final_states().contains(&q) {
                        final_counters.insert(counter.id());
                    }
                }
            }
            active_counters.push(active);
        }

        let mut final_conditions = BTreeMap::new();
        for &d in automaton.final_states() {
            let mut guard = algebra.bottom();
            for q in state_builder
                .members(d)
                .filter(|q| ca.final_states().contains(q))
            {
                let term = match ca.counter_of(q) {
                    Some(counter) => {
                        let cond = true_cond.update(counter.id(), CsCondition::CanExit)?;
                        algebra.mk_predicate(&algebra.alphabet().top(), &cond)?
                    }
                    None => algebra.top(),
                };
                guard = algebra.or(&guard, &term);
            }
            final_conditions.insert(d, CsLabel::mk_final_condition(guard));
        }

        tracing::debug!(
            states = automaton.state_count(),
            transitions = automaton.moves().len(),
            final_counters = final_counters.len(),
            "built counting-set automaton"
        );

        Ok(Self {
            algebra,
            automaton,
            state_builder,
            active_counters,
            final_counters,
            counters: ca.counters().into(),
            final_conditions,
        })
    }
}

impl<A: BooleanAlgebra> CsAutomaton<A> {
    /// The counters active in `state`; empty for an unknown state.
    pub fn counters_of_state(&self, state: StateIdx) -> &BTreeSet<usize> {
        static EMPTY: BTreeSet<usize> = BTreeSet::new();
        self.active_counters.get(state.idx()).unwrap_or(&EMPTY)
    }

    pub fn nr_of_counters(&self) -> usize {
        self.counters.len()
    }

    pub fn counter_info(&self, id: usize) -> Result<&Counter, Error> {
        self.counters.get(id).ok_or(Error::CounterOutOfRange {
            id,
            count: self.counters.len(),
        })
    }

    /// True when counter `id` belongs to a final counting state.
    pub fn is_final_counter(&self, id: usize) -> bool {
        self.final_counters.contains(&id)
    }

    pub fn initial_state(&self) -> StateIdx {
        self.automaton.initial_state()
    }

    pub fn is_final_state(&self, state: StateIdx) -> bool {
        self.automaton.is_final_state(state)
    }

    pub fn final_states(&self) -> &BTreeSet<StateIdx> {
        self.automaton.final_states()
    }

    pub fn states(&self) -> impl Iterator<Item = StateIdx> + '_ {
        self.automaton.states()
    }

    pub fn moves(&self) -> &[Move<CsLabel<A::Pred>>] {
        self.automaton.moves()
    }

    pub fn moves_from(&self, state: StateIdx) -> impl Iterator<Item = &Move<CsLabel<A::Pred>>> + '_ {
        self.automaton.moves_from(state)
    }

    /// The counting-automaton states `state` stands for.
    pub fn members(&self, state: StateIdx) -> impl Iterator<Item = StateIdx> + '_ {
        self.state_builder.members(state)
    }

    pub fn product_algebra(&self) -> &CsAlgebra<A> {
        &self.algebra
    }

    /// The acceptance condition of a final state, `None` for other states.
    pub fn final_condition(&self, state: StateIdx) -> Option<&CsLabel<A::Pred>> {
        self.final_conditions.get(&state)
    }

    pub fn describe_state(&self, state: StateIdx) -> String {
        self.describe_state_with(state, &RenderOptions::default())
    }

    /// The state id, the sorted member set (unless hidden) and one
    /// `(F)cK:[lower,upper]` line per active counter.
    pub fn describe_state_with(&self, state: StateIdx, options: &RenderOptions) -> String {
        let mut lines = vec![state.to_string()];
        if options.show_powersets {
            let members: Vec<String> = self.members(state).map(|q| q.to_string()).collect();
            lines.push(format!("{{{}}}", members.join(",")));
        }
        for &id in self.counters_of_state(state) {
            let Some(counter) = self.counters.get(id) else {
                continue;
            };
            let flag = if self.is_final_counter(id) { "(F)" } else { "" };
            lines.push(format!(
                "{}c{}:[{},{}]",
                flag,
                id,
                counter.lower_bound(),
                counter.upper_bound()
            ));
        }
        lines.join("\n")
    }

    /// `cK={0}` for the first counter active in the initial state.
    pub fn describe_start_label(&self) -> String {
        match self.counters_of_state(self.initial_state()).iter().next() {
            Some(id) => format!("c{}={{0}}", id),
            None => String::new(),
        }
    }

    /// Emit a Graphviz DOT representation of the automaton.
    pub fn to_dot(&self, mut buffer: impl Write, options: &RenderOptions) -> io::Result<()> {
        writeln!(buffer, "digraph \"{}\" {{", escape_dot(&options.name))?;
        writeln!(buffer, "\trankdir=LR;")?;
        writeln!(buffer, "\tstart [shape=point];")?;
        writeln!(
            buffer,
            "\tstart -> {} [label=\"{}\"];",
            self.initial_state(),
            escape_dot(&self.describe_start_label())
        )?;
        for state in self.states() {
            let label = escape_dot(&self.describe_state_with(state, options));
            if self.is_final_state(state) {
                writeln!(buffer, "\t{} [label=\"{}\", peripheries=2];", state, label)?;
            } else {
                writeln!(buffer, "\t{} [label=\"{}\"];", state, label)?;
            }
        }
        for m in self.moves() {
            writeln!(
                buffer,
                "\t{} -> {} [label=\"{}\"];",
                m.source,
                m.target,
                escape_dot(&m.label.describe(&self.algebra))
            )?;
        }
        writeln!(buffer, "}}")
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn condition() -> impl Strategy<Value = CsCondition> {
        (0u8..16).prop_map(CsCondition::from_bits)
    }

    fn update() -> impl Strategy<Value = CsUpdate> {
        (0u8..8).prop_map(CsUpdate::from_bits)
    }

    fn conditions() -> impl Strategy<Value = Vec<CsCondition>> {
        prop::collection::vec(condition(), 0..=MAX_COUNTERS)
    }

    // Three equally long condition vectors.
    fn condition_triple() -> impl Strategy<Value = (Vec<CsCondition>, Vec<CsCondition>, Vec<CsCondition>)>
    {
        (0..=MAX_COUNTERS).prop_flat_map(|n| {
            (
                prop::collection::vec(condition(), n),
                prop::collection::vec(condition(), n),
                prop::collection::vec(condition(), n),
            )
        })
    }

    fn update_triple() -> impl Strategy<Value = (Vec<CsUpdate>, Vec<CsUpdate>, Vec<CsUpdate>)> {
        (0..=MAX_COUNTERS).prop_flat_map(|n| {
            (
                prop::collection::vec(update(), n),
                prop::collection::vec(update(), n),
                prop::collection::vec(update(), n),
            )
        })
    }

    fn byte_class() -> impl Strategy<Value = ByteClass> {
        prop::collection::vec(any::<u8>(), 0..8).prop_map(ByteClass::from_bytes)
    }

    // A guard over two counters, from a conjunctive or a disjunctive
    // condition.
    fn guard_parts() -> impl Strategy<Value = (ByteClass, Vec<CsCondition>, bool)> {
        (byte_class(), prop::collection::vec(condition(), 2), any::<bool>())
    }

    // A concrete input: a byte and one fact per counter.
    fn point() -> impl Strategy<Value = (u8, Vec<CsCondition>)> {
        (
            any::<u8>(),
            prop::collection::vec(prop::sample::select(CsCondition::FACTS.to_vec()), 2),
        )
    }

    fn mk_guard(
        alg: &CsAlgebra<ByteAlgebra>,
        (pred, conds, is_and): &(ByteClass, Vec<CsCondition>, bool),
    ) -> CsPred<ByteClass> {
        let cond = if *is_and {
            CsConditionSeq::mk_and(conds).unwrap()
        } else {
            CsConditionSeq::mk_or(conds).unwrap()
        };
        alg.mk_predicate(pred, &cond).unwrap()
    }

    /// Number of products of `guard` containing the point.
    fn hits(guard: &CsPred<ByteClass>, (byte, facts): &(u8, Vec<CsCondition>)) -> usize {
        guard
            .products()
            .iter()
            .filter(|(pred, cond)| {
                pred.contains(*byte) && facts.iter().enumerate().all(|(i, &f)| cond[i].contains(f))
            })
            .count()
    }

    proptest! {
        /// Packing then reading back every position is the identity.
        #[test]
        fn condition_packing_roundtrip(conds in conditions()) {
            let and = CsConditionSeq::mk_and(&conds).unwrap();
            let or = CsConditionSeq::mk_or(&conds).unwrap();
            prop_assert_eq!(and.to_vec(), conds.clone());
            prop_assert_eq!(or.to_vec(), conds.clone());
            for (i, &c) in conds.iter().enumerate() {
                prop_assert_eq!(and[i], c);
                prop_assert_eq!(or.get(i), Some(c));
            }
        }

        #[test]
        fn conjunction_is_a_meet((a, b, c) in condition_triple()) {
            let a = CsConditionSeq::mk_and(&a).unwrap();
            let b = CsConditionSeq::mk_and(&b).unwrap();
            let c = CsConditionSeq::mk_and(&c).unwrap();
            let top = CsConditionSeq::mk_true(a.len()).unwrap();
            prop_assert_eq!((a & b).unwrap(), (b & a).unwrap());
            prop_assert_eq!(((a & b).unwrap() & c).unwrap(), (a & (b & c).unwrap()).unwrap());
            prop_assert_eq!((a & top).unwrap(), a);
            prop_assert_eq!((a & a).unwrap(), a);
        }

        #[test]
        fn complement_is_an_involution(conds in conditions()) {
            let and = CsConditionSeq::mk_and(&conds).unwrap();
            let or = CsConditionSeq::mk_or(&conds).unwrap();
            prop_assert_eq!(!!and, and);
            prop_assert_eq!(!!or, or);
            prop_assert_eq!((!and).is_satisfiable(), !and.is_valid());
            prop_assert_eq!((!or).is_valid(), !or.is_satisfiable());
        }

        #[test]
        fn de_morgan((a, b, _) in condition_triple()) {
            let a = CsConditionSeq::mk_and(&a).unwrap();
            let b = CsConditionSeq::mk_and(&b).unwrap();
            prop_assert_eq!(!(a & b).unwrap(), (!a | !b).unwrap());
        }

        #[test]
        fn update_merge_is_a_join((a, b, c) in update_triple()) {
            let noop = CsUpdateSeq::mk_noop(a.len()).unwrap();
            let all_noop = a.iter().all(|&u| u == CsUpdate::Noop);
            let a = CsUpdateSeq::mk(&a).unwrap();
            let b = CsUpdateSeq::mk(&b).unwrap();
            let c = CsUpdateSeq::mk(&c).unwrap();
            prop_assert_eq!((a | b).unwrap(), (b | a).unwrap());
            prop_assert_eq!(((a | b).unwrap() | c).unwrap(), (a | (b | c).unwrap()).unwrap());
            prop_assert_eq!((a | a).unwrap(), a);
            prop_assert_eq!((a | noop).unwrap(), a);
            prop_assert_eq!(a.is_noop(), all_noop);
        }

        /// Guards are disjoint sums and the boolean operations agree with
        /// pointwise membership.
        #[test]
        fn guard_algebra_is_pointwise(g in guard_parts(), h in guard_parts(), p in point()) {
            let alg = CsAlgebra::new(ByteAlgebra, 2).unwrap();
            let g = mk_guard(&alg, &g);
            let h = mk_guard(&alg, &h);
            let in_g = hits(&g, &p);
            let in_h = hits(&h, &p);
            prop_assert!(in_g <= 1);
            prop_assert!(in_h <= 1);

            let meet = alg.and(&g, &h);
            let join = alg.or(&g, &h);
            let neg = alg.not(&g);
            prop_assert!(hits(&meet, &p) <= 1);
            prop_assert!(hits(&join, &p) <= 1);
            prop_assert!(hits(&neg, &p) <= 1);
            prop_assert_eq!(hits(&meet, &p), in_g * in_h);
            prop_assert_eq!(hits(&join, &p), (in_g + in_h).min(1));
            prop_assert_eq!(hits(&neg, &p), 1 - in_g);
        }

        /// A guard built from a disjunction holds where the predicate holds
        /// and some position does.
        #[test]
        fn disjunction_split_is_exact(g in guard_parts(), p in point()) {
            let alg = CsAlgebra::new(ByteAlgebra, 2).unwrap();
            let (pred, conds, _) = &g;
            let guard = mk_guard(&alg, &(*pred, conds.clone(), false));
            let (byte, facts) = &p;
            let expected = pred.contains(*byte)
                && conds.iter().zip(facts).any(|(c, &f)| c.contains(f));
            prop_assert_eq!(hits(&guard, &p), usize::from(expected));
        }
    }
}
