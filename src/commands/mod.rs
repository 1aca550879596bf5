//! Static command tables.
//!
//! One phrase-keyed table holds every device command. Raw remote tokens that
//! do not read as phrases (`volume_up`, `11`, ...) reach it through the alias
//! layer instead of a second table, so a key can never shadow another.

use crate::executor::Action;

pub const NAMESPACE_PREFIX: &str = "keypad:";

#[derive(Debug)]
pub struct CommandEntry {
    pub trigger: &'static str,
    pub action: Action,
}

const fn entry(trigger: &'static str, action: Action) -> CommandEntry {
    CommandEntry { trigger, action }
}

pub static COMMANDS: &[CommandEntry] = &[
    entry("power on", Action::KeyEvent("KEYCODE_WAKEUP")),
    entry("power off", Action::KeyEvent("KEYCODE_SLEEP")),
    entry("home", Action::KeyEvent("3")),
    entry("exit", Action::KeyEvent("3")),
    entry("back", Action::KeyEvent("4")),
    entry("menu", Action::StartIntent("android.settings.SETTINGS")),
    entry("volume up", Action::KeyEvent("24")),
    entry("increase volume", Action::KeyEvent("24")),
    entry("volume down", Action::KeyEvent("25")),
    entry("decrease volume", Action::KeyEvent("25")),
    entry("mute", Action::KeyEvent("164")),
    entry("unmute", Action::KeyEvent("24")),
    entry("left", Action::KeyEvent("21")),
    entry("right", Action::KeyEvent("22")),
    entry("up", Action::KeyEvent("19")),
    entry("down", Action::KeyEvent("20")),
    entry("ok", Action::KeyEvent("23")),
    entry("okay", Action::KeyEvent("23")),
    entry("channel up", Action::KeyEvent("KEYCODE_CHANNEL_UP")),
    entry("channel down", Action::KeyEvent("KEYCODE_CHANNEL_DOWN")),
    entry("delete", Action::KeyEvent("KEYCODE_DEL")),
    entry("backspace", Action::KeyEvent("67")),
    entry(
        "amazon",
        Action::StartComponent(
            "com.amazon.firebat/com.amazon.firebatcore.deeplink.DeepLinkRoutingActivity",
        ),
    ),
    entry("netflix", Action::StartComponent("com.netflix.ninja/.MainActivity")),
    entry(
        "youtube",
        Action::StartComponent("com.amazon.firetv.youtube/dev.cobalt.app.MainActivity"),
    ),
    entry(
        "hotstar",
        Action::StartComponent("in.startv.hotstar/com.hotstar.MainActivity"),
    ),
    entry("0", Action::KeyEvent("KEYCODE_0")),
    entry("1", Action::KeyEvent("KEYCODE_1")),
    entry("2", Action::KeyEvent("KEYCODE_2")),
    entry("3", Action::KeyEvent("KEYCODE_3")),
    entry("4", Action::KeyEvent("KEYCODE_4")),
    entry("5", Action::KeyEvent("KEYCODE_5")),
    entry("6", Action::KeyEvent("KEYCODE_6")),
    entry("7", Action::KeyEvent("KEYCODE_7")),
    entry("8", Action::KeyEvent("KEYCODE_8")),
    entry("9", Action::KeyEvent("KEYCODE_9")),
];

/// Raw remote token -> phrase trigger in [`COMMANDS`].
pub static RAW_ALIASES: &[(&str, &str)] = &[
    ("awake", "power on"),
    ("sleep", "power off"),
    ("volume_up", "volume up"),
    ("volume_down", "volume down"),
    ("increment", "channel up"),
    ("decrement", "channel down"),
    ("11", "delete"),
    ("12", "backspace"),
];

pub fn lookup_phrase(phrase: &str) -> Option<&'static CommandEntry> {
    COMMANDS.iter().find(|entry| entry.trigger == phrase)
}

pub fn strip_namespace(token: &str) -> &str {
    let token = token.trim();
    token.strip_prefix(NAMESPACE_PREFIX).unwrap_or(token).trim()
}

/// Resolves a token received on the raw-command channel.
pub fn lookup_raw_token(token: &str) -> Option<&'static CommandEntry> {
    let key = strip_namespace(token);
    let phrase = RAW_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, phrase)| *phrase)
        .unwrap_or(key);
    lookup_phrase(phrase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn triggers_are_unique() {
        let mut seen = HashSet::new();
        for entry in COMMANDS {
            assert!(seen.insert(entry.trigger), "duplicate trigger {}", entry.trigger);
        }
    }

    #[test]
    fn every_alias_points_at_a_phrase() {
        for (alias, phrase) in RAW_ALIASES {
            assert!(lookup_phrase(phrase).is_some(), "{alias} -> {phrase} dangles");
            assert!(lookup_phrase(alias).is_none(), "{alias} shadows a phrase");
        }
    }

    #[test]
    fn raw_tokens_resolve_through_aliases_and_prefix() {
        assert_eq!(
            lookup_raw_token("volume_up").unwrap().action,
            Action::KeyEvent("24")
        );
        assert_eq!(
            lookup_raw_token("keypad:7").unwrap().action,
            Action::KeyEvent("KEYCODE_7")
        );
        assert_eq!(
            lookup_raw_token(" keypad:11 ").unwrap().action,
            Action::KeyEvent("KEYCODE_DEL")
        );
        assert_eq!(lookup_raw_token("home").unwrap().trigger, "home");
    }

    #[test]
    fn unknown_raw_tokens_miss() {
        assert!(lookup_raw_token("99").is_none());
        assert!(lookup_raw_token("keypad:").is_none());
        assert!(lookup_raw_token("").is_none());
    }

    #[test]
    fn phrases_do_not_accept_raw_aliases() {
        assert!(lookup_phrase("volume_up").is_none());
        assert_eq!(lookup_phrase("volume up").unwrap().action, Action::KeyEvent("24"));
    }
}
