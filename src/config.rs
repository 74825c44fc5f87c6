use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Deserialize;

/// Server configuration, loaded from a TOML file with every field optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub keyboard: KeyboardConfig,
    pub cursor: CursorConfig,
    pub render: RenderConfig,
    /// Hotkey bindings, e.g. `{ "mod+q" = "close-window" }`. The left side
    /// is a `+`-separated list of modifier names followed by an evdev key
    /// name ("q", "f1", ...).
    pub hotkeys: std::collections::HashMap<String, HotkeyAction>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keyboard: KeyboardConfig::default(),
            cursor: CursorConfig::default(),
            render: RenderConfig::default(),
            hotkeys: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeyboardConfig {
    pub layout: String,
    pub repeat_rate: i32,
    pub repeat_delay: i32,
    /// The compositor main modifier, matched in addition to explicit hotkey
    /// modifiers.
    pub main_mod: String,
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self {
            layout: "us".to_string(),
            repeat_rate: 25,
            repeat_delay: 600,
            main_mod: "alt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CursorConfig {
    pub theme: String,
    pub size: u32,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            theme: "default".to_string(),
            size: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    /// Path to a wallpaper image, fitted to each output.
    pub background: Option<PathBuf>,
    pub vsync: bool,
    pub max_frames_in_flight: u32,
    pub max_swapchain_images: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            background: None,
            vsync: true,
            max_frames_in_flight: 2,
            max_swapchain_images: 2,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HotkeyAction {
    CloseWindow,
    Terminate,
}

impl Config {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let config = toml::from_str(&text)
            .with_context(|| format!("parsing config from {}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.keyboard.repeat_rate, 25);
        assert_eq!(config.render.max_frames_in_flight, 2);
        assert!(config.render.vsync);
    }

    #[test]
    fn parse() {
        let config: Config = toml::from_str(
            r#"
            [keyboard]
            layout = "gb"
            main_mod = "super"

            [render]
            vsync = false

            [hotkeys]
            "mod+q" = "close-window"
            "#,
        )
        .unwrap();

        assert_eq!(config.keyboard.layout, "gb");
        assert!(!config.render.vsync);
        assert_eq!(
            config.hotkeys.get("mod+q"),
            Some(&HotkeyAction::CloseWindow)
        );
    }
}
