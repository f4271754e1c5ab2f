use std::collections::HashSet;

/// Track colors in preference order. The first entry is the primary color.
pub const TRACK_PALETTE: [&str; 7] = [
    "#0000FF", "#FF0000", "#00AA00", "#9b59b6", "#f1c40f", "#00FFFF", "#FF8000",
];

pub fn primary_color() -> &'static str {
    TRACK_PALETTE[0]
}

/// Picks the first palette color not currently in use. Once every color is
/// taken the palette wraps on the loaded overlay count.
pub fn allocate(in_use: &HashSet<&str>, loaded_count: usize) -> &'static str {
    TRACK_PALETTE
        .iter()
        .copied()
        .find(|color| !in_use.contains(color))
        .unwrap_or(TRACK_PALETTE[loaded_count % TRACK_PALETTE.len()])
}
