use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Number of increment slots and of store slots
pub const SLOTS: usize = 10;

/// How an increment slot advances once it has been started
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncrementMode {
    /// `type: "use"`, one step per resolution
    PerUse,
    /// `type: "msg"`, tracks the message number of the current pass
    PerMessage,
}

/// Mutable state for a single expansion pass.
///
/// Increment and store slots are shared by every message of the pass and thrown away with it, so two
/// expansions (concurrent or not) never see each other's counters.
#[derive(Debug)]
pub struct GenerationContext {
    increments: [Option<i64>; SLOTS],
    stores: [f64; SLOTS],
    message_count: usize,
    message_rand: u32,
    rng: StdRng,
}

impl Default for GenerationContext {
    fn default() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }
}

impl GenerationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reproducible random values, for tests and for replaying a run.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        GenerationContext {
            increments: [None; SLOTS],
            stores: [0.0; SLOTS],
            message_count: 0,
            message_rand: 0,
            rng,
        }
    }

    /// Starts the next message: bumps the message number and draws a new random selector.
    pub fn begin_message(&mut self) {
        self.message_count += 1;
        self.message_rand = self.rng.gen_range(0..=100);
    }

    /// 1 based number of the message currently being generated
    pub fn message_count(&self) -> usize {
        self.message_count
    }

    /// Per message selector in 0..=100, so several data file lookups in one message can pick aligned lines
    pub fn message_rand(&self) -> u32 {
        self.message_rand
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Advances increment `slot` and returns its new value.
    ///
    /// A slot that has never been used, or has reached `max`, restarts at `start`.
    pub fn next_increment(
        &mut self,
        slot: usize,
        start: i64,
        max: Option<i64>,
        mode: IncrementMode,
    ) -> i64 {
        let next = match self.increments[slot] {
            None => start,
            Some(current) if max.map_or(false, |max| current >= max) => start,
            Some(current) => match mode {
                IncrementMode::PerUse => current + 1,
                IncrementMode::PerMessage => start + self.message_count as i64 - 1,
            },
        };
        self.increments[slot] = Some(next);
        next
    }

    pub fn store(&mut self, slot: usize, value: f64) {
        self.stores[slot] = value;
    }

    /// Slots that were never written read as zero
    pub fn stored(&self, slot: usize) -> f64 {
        self.stores[slot]
    }
}
