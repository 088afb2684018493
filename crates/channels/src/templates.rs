//! Message content for each stage action.

use journey_core::types::ActionType;
use serde::{Deserialize, Serialize};

/// Rendered subject and HTML body for one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageContent {
    pub subject: String,
    pub body: String,
}

/// Render the content for `action`, greeting the recipient by `name`.
pub fn render(action: ActionType, name: &str) -> StageContent {
    let (subject, lead, items, closing) = match action {
        ActionType::WelcomeMessage => (
            "Welcome aboard!",
            "Thanks for stopping by. A few places to start:",
            ["Product overview", "Getting started guide", "Customer stories"],
            "Reply to this message if you'd like a short walkthrough.",
        ),
        ActionType::InformationalContent => (
            "Everything you need to compare",
            "You've been looking around. These might help you decide:",
            ["Feature comparison", "Frequently asked questions", "Free trial access"],
            "Our team is happy to answer anything specific.",
        ),
        ActionType::IncentiveOffer => (
            "A special offer, just for you",
            "Your cart is waiting. Here's something to make it easier:",
            ["20% off your first order", "Free onboarding session", "Priority support"],
            "This offer is valid for the next 48 hours.",
        ),
        ActionType::PurchaseConfirmation => (
            "Thank you for your purchase!",
            "Your order is confirmed. What happens next:",
            ["Order summary and receipt", "Setup instructions", "Support contacts"],
            "We're glad to have you with us.",
        ),
    };

    let list: String = items.iter().map(|item| format!("<li>{item}</li>")).collect();
    let body = format!(
        "<h2>Hi {name},</h2><p>{lead}</p><ul>{list}</ul><p>{closing}</p><p>Best regards,<br>The Team</p>"
    );

    StageContent {
        subject: subject.to_string(),
        body,
    }
}
