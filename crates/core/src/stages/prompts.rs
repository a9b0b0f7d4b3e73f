//! Default prompt templates bundled at compile time.

/// Requirements extractor - pulls candidate requirements from a conversation
pub const REQUIREMENTS_EXTRACTOR: &str = include_str!("defaults/requirements_extractor.md");

/// Epic planner - clusters ranked requirements into epics
pub const EPIC_PLANNER: &str = include_str!("defaults/epic_planner.md");

/// Story writer - decomposes one epic into user stories
pub const STORY_WRITER: &str = include_str!("defaults/story_writer.md");

/// All default prompts with their slugs
pub fn all_defaults() -> Vec<(&'static str, &'static str)> {
    vec![
        ("requirements_extractor", REQUIREMENTS_EXTRACTOR),
        ("epic_planner", EPIC_PLANNER),
        ("story_writer", STORY_WRITER),
    ]
}
