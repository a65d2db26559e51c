/// What a shard must remember to resume its gateway session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub session_id: Option<String>,
    /// Last dispatch sequence seen; echoed in heartbeats and resumes.
    pub sequence: Option<u64>,
    pub resume_url: Option<String>,
}

impl SessionState {
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some()
    }

    /// Record a dispatch sequence, returning the number of skipped events
    /// when it does not follow the previous one.
    pub fn observe(&mut self, seq: u64) -> Option<u64> {
        let gap = match self.sequence {
            Some(prev) if seq > prev + 1 => Some(seq - prev - 1),
            _ => None,
        };
        if self.sequence.map_or(true, |prev| seq > prev) {
            self.sequence = Some(seq);
        }
        gap
    }

    pub fn begin(&mut self, session_id: String, resume_url: Option<String>) {
        self.session_id = Some(session_id);
        self.resume_url = resume_url;
    }

    /// Forget the session entirely; the next connect must identify.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
