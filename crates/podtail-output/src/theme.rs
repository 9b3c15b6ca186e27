use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crossterm::style::Color;

use podtail_types::EventSource;

/// Colors used for source prefixes
pub struct Theme;

impl Theme {
    pub const PREFIX: [Color; 6] = [
        Color::Cyan,
        Color::Green,
        Color::Yellow,
        Color::Blue,
        Color::Magenta,
        Color::Red,
    ];

    pub const HEADER: Color = Color::DarkGrey;

    /// Stable prefix color for a source; every container of a pod shares it
    pub fn prefix(source: &EventSource) -> Color {
        let mut hasher = DefaultHasher::new();
        source.id.hash(&mut hasher);
        Self::PREFIX[(hasher.finish() % Self::PREFIX.len() as u64) as usize]
    }
}
