use journey_core::types::{Event, EventName, Stage};

/// Maps a session's events to a stage using fixed precedence:
/// purchase > add_to_cart / cta_click > product_view > page_view.
///
/// Precedence is independent of event order. Unrecognized names are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleClassifier;

impl RuleClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, events: &[Event]) -> Stage {
        self.classify_names(events.iter().map(|e| &e.event_name))
    }

    /// Single pass; stops early once the highest-precedence stage is seen.
    pub fn classify_names<'a>(&self, names: impl IntoIterator<Item = &'a EventName>) -> Stage {
        let mut best = Stage::Unknown;
        for name in names {
            let stage = match name {
                EventName::Purchase => return Stage::Purchase,
                EventName::AddToCart | EventName::CtaClick => Stage::Intent,
                EventName::ProductView => Stage::Consideration,
                EventName::PageView => Stage::Awareness,
                EventName::Other(_) => continue,
            };
            if rank(stage) > rank(best) {
                best = stage;
            }
        }
        best
    }

    /// Confidence assigned to a rule-derived stage.
    pub fn confidence(stage: Stage) -> f64 {
        if stage == Stage::Unknown {
            0.0
        } else {
            1.0
        }
    }
}

fn rank(stage: Stage) -> u8 {
    match stage {
        Stage::Unknown | Stage::Decision => 0,
        Stage::Awareness => 1,
        Stage::Consideration => 2,
        Stage::Intent => 3,
        Stage::Purchase => 4,
    }
}
