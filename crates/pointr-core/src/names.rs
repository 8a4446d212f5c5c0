// Case-insensitive uniqueness for participant names and story titles.

use crate::model::ParticipantId;

/// Comparison key for names and titles: trimmed and lower-cased.
pub fn name_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// `true` if no participant other than `exclude` already uses `candidate`.
///
/// `existing` yields `(participant id, current display name)` pairs.
pub fn is_name_available<'a, I>(existing: I, candidate: &str, exclude: Option<ParticipantId>) -> bool
where
    I: IntoIterator<Item = (ParticipantId, &'a str)>,
{
    let key = name_key(candidate);
    !existing
        .into_iter()
        .any(|(id, name)| Some(id) != exclude && name_key(name) == key)
}

/// Find a free variant of `name` by appending `_1`, `_2`, ... until one is
/// not taken. Returns `name` itself when it is already free.
pub fn suggest_name<'a, I>(existing: I, name: &str, exclude: Option<ParticipantId>) -> String
where
    I: IntoIterator<Item = (ParticipantId, &'a str)> + Clone,
{
    let mut suggestion = name.to_string();
    let mut counter = 1u32;
    while !is_name_available(existing.clone(), &suggestion, exclude) {
        suggestion = format!("{name}_{counter}");
        counter += 1;
    }
    suggestion
}

/// `true` if any existing title matches `candidate` case-insensitively.
pub fn is_title_taken<'a, I>(existing: I, candidate: &str) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    let key = name_key(candidate);
    existing.into_iter().any(|title| name_key(title) == key)
}
