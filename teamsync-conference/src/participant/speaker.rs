use std::collections::{HashMap, HashSet};

use crate::types::ParticipantId;

/// Level-threshold active-speaker detection.
///
/// Holds only the latest level per participant and whether each is currently
/// above the threshold; the result is advisory UI state.
#[derive(Debug)]
pub struct ActiveSpeakerDetector {
    threshold: f32,
    levels: HashMap<ParticipantId, f32>,
    speaking: HashSet<ParticipantId>,
}

impl ActiveSpeakerDetector {
    #[must_use]
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            levels: HashMap::new(),
            speaking: HashSet::new(),
        }
    }

    /// Mean of one analyser frame of byte frequency data
    #[must_use]
    pub fn average_level(frame: &[u8]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let sum: u32 = frame.iter().map(|&v| u32::from(v)).sum();
        sum as f32 / frame.len() as f32
    }

    pub fn report_level(&mut self, participant: ParticipantId, level: f32) {
        self.levels.insert(participant, level);
    }

    /// Re-evaluate every reported level. Returns only the participants whose
    /// speaking flag changed, sorted by id.
    pub fn sample(&mut self, mic_on: impl Fn(&ParticipantId) -> bool) -> Vec<(ParticipantId, bool)> {
        let mut changes: Vec<_> = self
            .levels
            .iter()
            .filter_map(|(id, &level)| {
                let now = level > self.threshold && mic_on(id);
                (now != self.speaking.contains(id)).then(|| (id.clone(), now))
            })
            .collect();
        for (id, speaking) in &changes {
            if *speaking {
                self.speaking.insert(id.clone());
            } else {
                self.speaking.remove(id);
            }
        }
        changes.sort();
        changes
    }

    #[must_use]
    pub fn is_speaking(&self, participant: &ParticipantId) -> bool {
        self.speaking.contains(participant)
    }

    /// Drop a participant. Returns whether it was speaking.
    pub fn forget(&mut self, participant: &ParticipantId) -> bool {
        self.levels.remove(participant);
        self.speaking.remove(participant)
    }

    pub fn clear(&mut self) {
        self.levels.clear();
        self.speaking.clear();
    }
}
