//! Desktop environment detection and the per-environment command tables used
//! to blank the screen and lock the session.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesktopEnvironment {
    Gnome,
    Kde,
    Xfce,
    Lxde,
    Lxqt,
    Mate,
    Cinnamon,
    Sway,
    I3,
    Deepin,
    Enlightenment,
    Pantheon,
    Unity,
    Unknown,
}

/// Session markers checked in order; the first one set wins.
const SESSION_VARIABLES: &[&str] = &["XDG_CURRENT_DESKTOP", "DESKTOP_SESSION"];

/// Variables whose mere presence identifies an environment.
const MARKER_VARIABLES: &[(&str, DesktopEnvironment)] = &[
    ("GNOME_DESKTOP_SESSION_ID", DesktopEnvironment::Gnome),
    ("MATE_DESKTOP_SESSION_ID", DesktopEnvironment::Mate),
    ("CINNAMON_VERSION", DesktopEnvironment::Cinnamon),
    ("SWAYSOCK", DesktopEnvironment::Sway),
    ("I3SOCK", DesktopEnvironment::I3),
];

/// Session processes probed when the environment says nothing.
const SESSION_PROCESSES: &[(&str, DesktopEnvironment)] = &[
    ("gnome-shell", DesktopEnvironment::Gnome),
    ("plasmashell", DesktopEnvironment::Kde),
    ("kdeinit5", DesktopEnvironment::Kde),
    ("xfce4-session", DesktopEnvironment::Xfce),
    ("lxsession", DesktopEnvironment::Lxde),
    ("lxqt-session", DesktopEnvironment::Lxqt),
    ("mate-session", DesktopEnvironment::Mate),
    ("cinnamon", DesktopEnvironment::Cinnamon),
    ("sway", DesktopEnvironment::Sway),
    ("i3", DesktopEnvironment::I3),
];

const GENERIC_SCREEN_OFF: &[&str] = &[
    "xset dpms force off",
    "vbetool dpms off",
    "xrandr --output $(xrandr | grep ' connected' | head -n 1 | cut -d ' ' -f1) --off",
];

const GENERIC_LOCK: &[&str] = &[
    "xdg-screensaver lock",
    "loginctl lock-session",
    "light-locker-command -l",
];

impl DesktopEnvironment {
    /// Match a session name such as `ubuntu:GNOME` or `plasma`.
    pub fn from_session_name(name: &str) -> Option<Self> {
        let name = name.to_lowercase();
        let table: &[(&str, DesktopEnvironment)] = &[
            ("gnome", DesktopEnvironment::Gnome),
            ("kde", DesktopEnvironment::Kde),
            ("plasma", DesktopEnvironment::Kde),
            ("xfce", DesktopEnvironment::Xfce),
            ("lxde", DesktopEnvironment::Lxde),
            ("lxqt", DesktopEnvironment::Lxqt),
            ("mate", DesktopEnvironment::Mate),
            ("cinnamon", DesktopEnvironment::Cinnamon),
            ("sway", DesktopEnvironment::Sway),
            ("i3", DesktopEnvironment::I3),
            ("deepin", DesktopEnvironment::Deepin),
            ("enlightenment", DesktopEnvironment::Enlightenment),
            ("pantheon", DesktopEnvironment::Pantheon),
            ("unity", DesktopEnvironment::Unity),
        ];
        table.iter().find(|&&(needle, _)| name.contains(needle)).map(|&(_, de)| de)
    }

    /// Commands that blank the display, most specific first.
    pub fn screen_off_commands(self) -> Vec<&'static str> {
        let specific: &[&str] = match self {
            DesktopEnvironment::Kde => &["kscreen-doctor --dpms off"],
            DesktopEnvironment::Gnome => &[
                "busctl --user set-property org.gnome.Mutter.DisplayConfig /org/gnome/Mutter/DisplayConfig org.gnome.Mutter.DisplayConfig PowerSaveMode i 1",
            ],
            DesktopEnvironment::Sway => &["swaymsg 'output * dpms off'"],
            _ => &[],
        };
        specific.iter().chain(GENERIC_SCREEN_OFF).copied().collect()
    }

    /// Commands that lock the session, most specific first.
    pub fn lock_commands(self) -> Vec<&'static str> {
        let specific: &[&str] = match self {
            DesktopEnvironment::Gnome | DesktopEnvironment::Unity => &[
                "gnome-screensaver-command -l",
                "dbus-send --type=method_call --dest=org.gnome.ScreenSaver /org/gnome/ScreenSaver org.gnome.ScreenSaver.Lock",
            ],
            DesktopEnvironment::Kde => &[
                "loginctl lock-session",
                "qdbus org.freedesktop.ScreenSaver /ScreenSaver Lock",
            ],
            DesktopEnvironment::Xfce => &["xflock4"],
            DesktopEnvironment::Lxde => &["lxlock"],
            DesktopEnvironment::Lxqt => &["lxqt-leave --lock"],
            DesktopEnvironment::Mate => &["mate-screensaver-command -l"],
            DesktopEnvironment::Cinnamon => &["cinnamon-screensaver-command -l"],
            DesktopEnvironment::I3 => &["i3lock"],
            DesktopEnvironment::Sway => &["swaylock -f"],
            DesktopEnvironment::Deepin => &[
                "dbus-send --system --print-reply --dest=org.freedesktop.login1 /org/freedesktop/login1 org.freedesktop.login1.Manager.LockSessions",
            ],
            DesktopEnvironment::Enlightenment => &["enlightenment_remote -desktop-lock"],
            DesktopEnvironment::Pantheon => &["dm-tool lock"],
            DesktopEnvironment::Unknown => &[],
        };
        specific.iter().chain(GENERIC_LOCK).copied().collect()
    }
}

/// Detect the environment from session variables alone.
pub fn detect_from_env<F>(lookup: F) -> Option<DesktopEnvironment>
where
    F: Fn(&str) -> Option<String>,
{
    for &key in SESSION_VARIABLES {
        if let Some(value) = lookup(key) {
            if !value.is_empty() {
                if let Some(de) = DesktopEnvironment::from_session_name(&value) {
                    return Some(de);
                }
            }
        }
    }

    MARKER_VARIABLES
        .iter()
        .find(|&&(key, _)| lookup(key).is_some())
        .map(|&(_, de)| de)
}

/// Environment inspection first, then probing for session processes.
pub fn detect<F, P>(lookup: F, running: P) -> DesktopEnvironment
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> bool,
{
    if let Some(de) = detect_from_env(lookup) {
        return de;
    }

    SESSION_PROCESSES
        .iter()
        .find(|&&(name, _)| running(name))
        .map(|&(_, de)| de)
        .unwrap_or(DesktopEnvironment::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_detects_from_current_desktop() {
        assert_eq!(detect_from_env(env(&[("XDG_CURRENT_DESKTOP", "ubuntu:GNOME")])), Some(DesktopEnvironment::Gnome));
        assert_eq!(detect_from_env(env(&[("XDG_CURRENT_DESKTOP", "KDE")])), Some(DesktopEnvironment::Kde));
        assert_eq!(detect_from_env(env(&[("DESKTOP_SESSION", "plasma")])), Some(DesktopEnvironment::Kde));
        assert_eq!(detect_from_env(env(&[("MATE_DESKTOP_SESSION_ID", "1")])), Some(DesktopEnvironment::Mate));
        assert_eq!(detect_from_env(env(&[])), None);
    }

    #[test]
    fn test_falls_back_to_process_probe() {
        let de = detect(env(&[]), |name| name == "xfce4-session");
        assert_eq!(de, DesktopEnvironment::Xfce);

        let de = detect(env(&[]), |_| false);
        assert_eq!(de, DesktopEnvironment::Unknown);
    }

    #[test]
    fn test_environment_beats_processes() {
        let de = detect(env(&[("XDG_CURRENT_DESKTOP", "sway")]), |name| name == "gnome-shell");
        assert_eq!(de, DesktopEnvironment::Sway);
    }

    #[test]
    fn test_command_tables_end_with_generic_fallback() {
        let lock = DesktopEnvironment::Xfce.lock_commands();
        assert_eq!(lock.first(), Some(&"xflock4"));
        assert_eq!(lock.last(), Some(&"light-locker-command -l"));

        let unknown = DesktopEnvironment::Unknown.lock_commands();
        assert_eq!(unknown, GENERIC_LOCK.to_vec());

        let screen = DesktopEnvironment::Kde.screen_off_commands();
        assert_eq!(screen[0], "kscreen-doctor --dpms off");
        assert_eq!(&screen[1..], GENERIC_SCREEN_OFF);
    }
}
