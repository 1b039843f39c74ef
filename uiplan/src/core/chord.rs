//! Key chord parsing (`ESC`, `ENTER`, `CMD+A`, `CMD+SHIFT+S`).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Command,
    Control,
    Alt,
    Shift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChordKey {
    Escape,
    Return,
    Tab,
    Space,
    Backspace,
    Delete,
    Char(char),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chord {
    pub modifiers: Vec<Modifier>,
    pub key: ChordKey,
}

fn modifier(name: &str) -> Option<Modifier> {
    match name {
        "CMD" | "COMMAND" | "META" | "SUPER" => Some(Modifier::Command),
        "CTRL" | "CONTROL" => Some(Modifier::Control),
        "ALT" | "OPT" | "OPTION" => Some(Modifier::Alt),
        "SHIFT" => Some(Modifier::Shift),
        _ => None,
    }
}

fn key(name: &str) -> Option<ChordKey> {
    match name {
        "ESC" | "ESCAPE" => Some(ChordKey::Escape),
        "ENTER" | "RETURN" => Some(ChordKey::Return),
        "TAB" => Some(ChordKey::Tab),
        "SPACE" => Some(ChordKey::Space),
        "BACKSPACE" => Some(ChordKey::Backspace),
        "DELETE" | "DEL" => Some(ChordKey::Delete),
        _ => {
            let mut chars = name.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphanumeric() => {
                    Some(ChordKey::Char(c.to_ascii_lowercase()))
                }
                _ => None,
            }
        }
    }
}

/// Parse a chord. Returns `None` for anything that is not a known key with
/// optional known modifiers; callers type such input literally.
pub fn parse_chord(raw: &str) -> Option<Chord> {
    let upper = raw.trim().to_ascii_uppercase();
    let mut parts: Vec<&str> = upper.split('+').map(str::trim).collect();
    let last = parts.pop()?;
    let key = key(last)?;
    let modifiers = parts
        .into_iter()
        .map(modifier)
        .collect::<Option<Vec<_>>>()?;
    Some(Chord { modifiers, key })
}
