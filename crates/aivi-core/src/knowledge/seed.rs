//! Built-in entries used when durable storage is empty or unusable

use super::entry::{KnowledgeEntry, NewKnowledgeEntry};
use chrono::{DateTime, Utc};

pub const SEED_SOURCE: &str = "builtin";

pub fn default_entries(now: DateTime<Utc>) -> Vec<KnowledgeEntry> {
    let seeds = [
        NewKnowledgeEntry::new(
            "What is AI?",
            "Artificial Intelligence (AI) is technology that enables machines to simulate human \
             intelligence, such as learning from examples, recognizing speech and solving problems.",
            SEED_SOURCE,
            0.9,
        )
        .with_field("Computer Science"),
        NewKnowledgeEntry::new(
            "What is photosynthesis?",
            "Photosynthesis is the process by which plants use sunlight, water and carbon dioxide \
             to produce glucose and oxygen.",
            SEED_SOURCE,
            0.95,
        )
        .with_category("academic")
        .with_field("Biology"),
        NewKnowledgeEntry::new(
            "What is gravity?",
            "Gravity is a fundamental force that attracts objects with mass toward each other.",
            SEED_SOURCE,
            0.9,
        )
        .with_category("science")
        .with_field("Physics"),
    ];

    seeds
        .into_iter()
        .enumerate()
        .map(|(i, new)| KnowledgeEntry::from_new(format!("seed-{}", i + 1), new, now))
        .collect()
}
