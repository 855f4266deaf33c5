use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed set of categories a customer email can be filed under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Delivery,
    Cancellation,
    Refund,
    Return,
    Presale,
    Resolved,
    Spam,
    #[default]
    Other,
}

/// Provider label colour pair (Gmail palette values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelColor {
    pub background: &'static str,
    pub text: &'static str,
}

/// Used when the provider rejects a category's own colour.
pub const FALLBACK_COLOR: LabelColor = LabelColor {
    background: "#999999",
    text: "#ffffff",
};

struct CategoryInfo {
    key: &'static str,
    emoji: char,
    display_name: &'static str,
    color: LabelColor,
    keywords_en: &'static [&'static str],
    keywords_fr: &'static [&'static str],
}

const DELIVERY: CategoryInfo = CategoryInfo {
    key: "delivery",
    emoji: '📦',
    display_name: "📦 Delivery",
    color: LabelColor { background: "#4a86e8", text: "#ffffff" },
    keywords_en: &["delivery", "shipping", "shipment", "tracking", "package", "parcel", "where is my order"],
    keywords_fr: &["livraison", "expédition", "expedition", "colis", "suivi", "où est ma commande"],
};

const CANCELLATION: CategoryInfo = CategoryInfo {
    key: "cancellation",
    emoji: '❌',
    display_name: "❌ Cancellation",
    color: LabelColor { background: "#fb4c2f", text: "#ffffff" },
    keywords_en: &["cancellation", "cancel"],
    keywords_fr: &["annulation", "annuler"],
};

const REFUND: CategoryInfo = CategoryInfo {
    key: "refund",
    emoji: '💰',
    display_name: "💰 Refund",
    color: LabelColor { background: "#16a766", text: "#ffffff" },
    keywords_en: &["refund", "reimburse", "money back"],
    keywords_fr: &["remboursement", "rembourser"],
};

const RETURN: CategoryInfo = CategoryInfo {
    key: "return",
    emoji: '🔄',
    display_name: "🔄 Return",
    color: LabelColor { background: "#ffad47", text: "#ffffff" },
    keywords_en: &["return", "exchange"],
    keywords_fr: &["retour", "retourner", "échange", "echange"],
};

const PRESALE: CategoryInfo = CategoryInfo {
    key: "presale",
    emoji: '🛍',
    display_name: "🛍️ Presale",
    color: LabelColor { background: "#a479e2", text: "#ffffff" },
    keywords_en: &["presale", "pre-sale", "pre sale", "product question", "availability"],
    keywords_fr: &["avant-vente", "avant vente", "prévente", "prevente", "question produit", "disponibilité"],
};

const RESOLVED: CategoryInfo = CategoryInfo {
    key: "resolved",
    emoji: '✅',
    display_name: "✅ Resolved",
    color: LabelColor { background: "#43d692", text: "#ffffff" },
    keywords_en: &["resolved", "solved", "closed"],
    keywords_fr: &["résolu", "resolu", "clos"],
};

const SPAM: CategoryInfo = CategoryInfo {
    key: "spam",
    emoji: '🚫',
    display_name: "🚫 Spam",
    color: LabelColor { background: "#666666", text: "#ffffff" },
    keywords_en: &["spam", "junk", "phishing"],
    keywords_fr: &["indésirable", "indesirable", "pourriel"],
};

const OTHER: CategoryInfo = CategoryInfo {
    key: "other",
    emoji: '📝',
    display_name: "📝 Other",
    color: LabelColor { background: "#cccccc", text: "#000000" },
    keywords_en: &["other", "misc"],
    keywords_fr: &["autre", "divers"],
};

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Delivery,
        Category::Cancellation,
        Category::Refund,
        Category::Return,
        Category::Presale,
        Category::Resolved,
        Category::Spam,
        Category::Other,
    ];

    fn info(self) -> &'static CategoryInfo {
        match self {
            Category::Delivery => &DELIVERY,
            Category::Cancellation => &CANCELLATION,
            Category::Refund => &REFUND,
            Category::Return => &RETURN,
            Category::Presale => &PRESALE,
            Category::Resolved => &RESOLVED,
            Category::Spam => &SPAM,
            Category::Other => &OTHER,
        }
    }

    pub fn key(self) -> &'static str {
        self.info().key
    }

    pub fn emoji(self) -> char {
        self.info().emoji
    }

    /// Name used for the provider label and for persisted activity records.
    pub fn display_name(self) -> &'static str {
        self.info().display_name
    }

    pub fn color(self) -> LabelColor {
        self.info().color
    }

    /// Maps an arbitrary category string onto the closest standard category.
    ///
    /// Resolution order: exact name/key match, shared emoji prefix, keyword
    /// match over the English and French keyword lists, then `Other`.
    pub fn normalize(raw: &str) -> Category {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Category::Other;
        }

        if let Some(exact) = Self::ALL.iter().copied().find(|c| {
            trimmed.eq_ignore_ascii_case(c.key())
                || trimmed.to_lowercase() == c.display_name().to_lowercase()
        }) {
            return exact;
        }

        if let Some(emoji) = leading_emoji(trimmed) {
            if let Some(found) = Self::ALL.iter().copied().find(|c| c.emoji() == emoji) {
                return found;
            }
        }
        if let Some(found) = Self::ALL.iter().copied().find(|c| trimmed.contains(c.emoji())) {
            return found;
        }

        let lowered = trimmed.to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|c| {
                let info = c.info();
                info.keywords_en
                    .iter()
                    .chain(info.keywords_fr.iter())
                    .any(|k| starts_a_word(&lowered, k))
            })
            .unwrap_or(Category::Other)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// True when `keyword` occurs in `text` at the start of a word. Keywords
/// act as stems, so "livraison" matches "livraisons" but "clos" does not
/// match "enclosed".
fn starts_a_word(text: &str, keyword: &str) -> bool {
    text.match_indices(keyword).any(|(at, _)| {
        text[..at]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric())
    })
}

/// First pictographic character of the string, ignoring variation selectors.
fn leading_emoji(s: &str) -> Option<char> {
    let first = s.chars().find(|c| *c != '\u{fe0f}' && !c.is_whitespace())?;
    if first.is_alphanumeric() || first.is_ascii() {
        None
    } else {
        Some(first)
    }
}
