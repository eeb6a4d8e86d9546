/// Default number of buffered fragments before an utterance is considered
/// long enough to transcribe (~3 seconds at 250ms per browser media chunk).
pub const DEFAULT_UTTERANCE_THRESHOLD: usize = 12;

/// Accumulates raw audio fragments while the session is listening and decides
/// when a contiguous run of them is worth transcribing.
///
/// There is no voice-activity detection here: the policy is a fixed fragment
/// count plus a short trailing quiescence delay. The delay itself is scheduled
/// by the session loop (it owns the event channel); this type only answers
/// "is the buffer over the threshold" and hands out its contents exactly once.
pub struct UtteranceBuffer {
    fragments: Vec<Vec<u8>>,
    threshold: usize,
}

impl UtteranceBuffer {
    pub fn new(threshold: usize) -> Self {
        Self {
            fragments: Vec::new(),
            threshold,
        }
    }

    /// Append one fragment, returning the new fragment count.
    pub fn push(&mut self, fragment: Vec<u8>) -> usize {
        self.fragments.push(fragment);
        self.fragments.len()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Whether enough audio has accumulated to schedule a finalize.
    pub fn over_threshold(&self) -> bool {
        self.fragments.len() >= self.threshold
    }

    /// Atomically drain the buffer into one contiguous byte run, in arrival
    /// order. The drained content is never revisited.
    pub fn take(&mut self) -> Vec<u8> {
        let fragments = std::mem::take(&mut self.fragments);
        fragments.concat()
    }

    /// Discard everything, e.g. when a finalize fires after the state has
    /// already moved away from listening.
    pub fn clear(&mut self) {
        self.fragments.clear();
    }
}
