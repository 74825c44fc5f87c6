//! Input-source aggregation and routing: evdev channels from the backend
//! flow through the virtual seat's counting sets and XKB state, then out to
//! hotkeys or the focused client.

use glam::DVec2;
use hashbrown::{HashMap, HashSet};
use tracing::{debug, trace, warn};
use xkbcommon::xkb;

use crate::{
    backend::{InputChannel, InputInfo},
    compositor::{sealed::SealedFile, State},
    config::HotkeyAction,
};

/// Kernel input event codes, as delivered by the backend.
pub mod evdev {
    pub const EV_KEY: u16 = 0x01;
    pub const EV_REL: u16 = 0x02;
    pub const EV_ABS: u16 = 0x03;

    pub const REL_X: u16 = 0x00;
    pub const REL_Y: u16 = 0x01;
    pub const REL_HWHEEL: u16 = 0x06;
    pub const REL_WHEEL: u16 = 0x08;

    pub const ABS_X: u16 = 0x00;
    pub const ABS_Y: u16 = 0x01;

    pub const BTN_MOUSE: u16 = 0x110;
    pub const BTN_LEFT: u16 = 0x110;
    pub const BTN_RIGHT: u16 = 0x111;
    pub const BTN_MIDDLE: u16 = 0x112;
    pub const BTN_TASK: u16 = 0x117;

    pub const KEY_ESC: u16 = 1;
    pub const KEY_TAB: u16 = 15;
    pub const KEY_ENTER: u16 = 28;
    pub const KEY_SPACE: u16 = 57;
    pub const KEY_F1: u16 = 59;
    pub const KEY_F11: u16 = 87;
    pub const KEY_F12: u16 = 88;

    pub const KEY_MAX: u16 = 0x2ff;
}

/// Multiset of pressed key codes, aggregated across source devices. The
/// XKB state machine only advances on edges.
#[derive(Debug, Default)]
pub struct CountingSet {
    counts: HashMap<u16, u32>,
}

impl CountingSet {
    /// Returns true on the 0 -> 1 edge.
    pub fn inc(&mut self, code: u16) -> bool {
        let count = self.counts.entry(code).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns true on the 1 -> 0 edge.
    pub fn dec(&mut self, code: u16) -> bool {
        match self.counts.get_mut(&code) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(&code);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, code: u16) -> bool {
        self.counts.contains_key(&code)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn codes(&self) -> impl Iterator<Item = u16> + '_ {
        self.counts.keys().copied()
    }
}

/// Compositor-level modifier set. `MOD` is the configured main modifier.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Modifiers(u32);

impl Modifiers {
    pub const NONE: Modifiers = Modifiers(0);
    pub const MOD: Modifiers = Modifiers(1 << 0);
    pub const SUPER: Modifiers = Modifiers(1 << 1);
    pub const SHIFT: Modifiers = Modifiers(1 << 2);
    pub const CTRL: Modifiers = Modifiers(1 << 3);
    pub const ALT: Modifiers = Modifiers(1 << 4);
    pub const NUM: Modifiers = Modifiers(1 << 5);
    pub const CAPS: Modifiers = Modifiers(1 << 6);

    /// Lock-class modifiers, ignored for hotkey matching.
    pub const LOCKS: Modifiers = Modifiers(Self::NUM.0 | Self::CAPS.0);

    pub fn contains(&self, other: Modifiers) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(&self, other: Modifiers) -> Modifiers {
        Modifiers(self.0 | other.0)
    }

    pub fn difference(&self, other: Modifiers) -> Modifiers {
        Modifiers(self.0 & !other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn from_name(name: &str) -> Option<Modifiers> {
        match name {
            "mod" => Some(Self::MOD),
            "super" | "logo" => Some(Self::SUPER),
            "shift" => Some(Self::SHIFT),
            "ctrl" | "control" => Some(Self::CTRL),
            "alt" => Some(Self::ALT),
            _ => None,
        }
    }
}

/// The seat keyboard's XKB keymap and state machine. The compiled keymap
/// text is published to clients through a sealed memfd.
pub struct Xkb {
    _context: xkb::Context,
    pub keymap: xkb::Keymap,
    pub state: xkb::State,
    pub keymap_file: SealedFile,
    mod_masks: [(Modifiers, xkb::ModMask); 6],
}

impl Xkb {
    pub fn new(layout: &str) -> anyhow::Result<Self> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);

        let keymap = xkb::Keymap::new_from_names(
            &context,
            "",
            "",
            layout,
            "",
            None,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .ok_or_else(|| anyhow::anyhow!("failed to compile keymap for layout {layout:?}"))?;

        let state = xkb::State::new(&keymap);

        let mut text = keymap.get_as_string(xkb::KEYMAP_FORMAT_TEXT_V1).into_bytes();
        text.push(0);
        let keymap_file = SealedFile::new(c"prism-keymap", &text)?;

        let mask = |name: &str| -> xkb::ModMask {
            let index = keymap.mod_get_index(name);
            if index == xkb::MOD_INVALID {
                0
            } else {
                1 << index
            }
        };

        let mod_masks = [
            (Modifiers::SHIFT, mask(xkb::MOD_NAME_SHIFT)),
            (Modifiers::CTRL, mask(xkb::MOD_NAME_CTRL)),
            (Modifiers::ALT, mask(xkb::MOD_NAME_ALT)),
            (Modifiers::SUPER, mask(xkb::MOD_NAME_LOGO)),
            (Modifiers::NUM, mask(xkb::MOD_NAME_NUM)),
            (Modifiers::CAPS, mask(xkb::MOD_NAME_CAPS)),
        ];

        Ok(Self {
            _context: context,
            keymap,
            state,
            keymap_file,
            mod_masks,
        })
    }

    /// Evdev codes are offset by 8 in XKB keycode space.
    pub fn update_key(&mut self, code: u16, pressed: bool) -> xkb::StateComponent {
        let direction = if pressed {
            xkb::KeyDirection::Down
        } else {
            xkb::KeyDirection::Up
        };

        self.state
            .update_key(xkb::Keycode::new(code as u32 + 8), direction)
    }

    fn mods_from_mask(&self, mask: xkb::ModMask) -> Modifiers {
        let mut mods = Modifiers::NONE;
        for (modifier, mod_mask) in self.mod_masks {
            if mod_mask != 0 && mask & mod_mask != 0 {
                mods = mods.union(modifier);
            }
        }
        mods
    }

    /// Depressed and latched modifiers, the set hotkeys match against.
    pub fn pressed_modifiers(&self) -> Modifiers {
        let mask = self.state.serialize_mods(xkb::STATE_MODS_DEPRESSED)
            | self.state.serialize_mods(xkb::STATE_MODS_LATCHED);
        self.mods_from_mask(mask)
    }

    pub fn effective_modifiers(&self) -> Modifiers {
        let mask = self.state.serialize_mods(xkb::STATE_MODS_EFFECTIVE);
        self.mods_from_mask(mask)
    }

    /// Raw masks for wl_keyboard.modifiers.
    pub fn serialize(&self) -> (u32, u32, u32, u32) {
        (
            self.state.serialize_mods(xkb::STATE_MODS_DEPRESSED),
            self.state.serialize_mods(xkb::STATE_MODS_LATCHED),
            self.state.serialize_mods(xkb::STATE_MODS_LOCKED),
            self.state.serialize_layout(xkb::STATE_LAYOUT_EFFECTIVE),
        )
    }
}

/// Hotkey bindings: exact modifier match, ignoring lock-class modifiers.
/// Releases are reported to whichever binding the press matched, even if
/// the modifiers changed in between.
#[derive(Default)]
pub struct Hotkeys {
    bindings: HashMap<(Modifiers, u16), HotkeyAction>,
    pressed: HashMap<u16, (Modifiers, HotkeyAction)>,
    pub main_mod: Modifiers,
}

impl Hotkeys {
    pub fn bind(&mut self, mods: Modifiers, code: u16, action: HotkeyAction) -> bool {
        match self.bindings.entry((mods.difference(Modifiers::LOCKS), code)) {
            hashbrown::hash_map::Entry::Occupied(_) => false,
            hashbrown::hash_map::Entry::Vacant(entry) => {
                entry.insert(action);
                true
            }
        }
    }

    /// Folds the main modifier into the `MOD` pseudo-bit and strips
    /// lock-class modifiers.
    fn normalize(&self, active: Modifiers) -> Modifiers {
        let active = active.difference(Modifiers::LOCKS);
        if !self.main_mod.is_empty() && active.contains(self.main_mod) {
            active.difference(self.main_mod).union(Modifiers::MOD)
        } else {
            active
        }
    }

    pub fn press(&mut self, active: Modifiers, code: u16) -> Option<HotkeyAction> {
        let mods = self.normalize(active);
        let action = *self.bindings.get(&(mods, code))?;
        self.pressed.insert(code, (mods, action));
        Some(action)
    }

    pub fn release(&mut self, code: u16) -> Option<HotkeyAction> {
        self.pressed.remove(&code).map(|(_, action)| action)
    }
}

/// A physical device delivered by the backend. Sources are dumb buckets of
/// pressed evdev codes; all interpretation happens on the seat.
pub struct InputSource {
    pub info: InputInfo,
    pub pressed: HashSet<u16>,
}

impl State {
    pub fn handle_input_added(&mut self, info: InputInfo) {
        debug!(id = info.id, ?info.kind, name = %info.name, "input source added");
        self.input_sources.insert(
            info.id,
            InputSource {
                info,
                pressed: HashSet::new(),
            },
        );
    }

    /// A disconnecting source releases everything it still holds, so the
    /// seat aggregation stays balanced.
    pub fn handle_input_removed(&mut self, id: u64) {
        let Some(source) = self.input_sources.remove(&id) else {
            return;
        };

        debug!(id, "input source removed");
        for code in source.pressed {
            self.source_key(code, false);
        }
    }

    pub fn handle_input_event(&mut self, id: u64, channels: &[InputChannel]) {
        let mut motion = DVec2::ZERO;
        let mut scroll = DVec2::ZERO;
        let mut scroll_detents = DVec2::ZERO;
        let mut absolute: Option<DVec2> = None;

        for channel in channels {
            match channel.kind {
                evdev::EV_KEY => {
                    let pressed = channel.value != 0.0;
                    let code = channel.code;

                    let edge = {
                        let Some(source) = self.input_sources.get_mut(&id) else {
                            continue;
                        };
                        if pressed {
                            source.pressed.insert(code)
                        } else {
                            source.pressed.remove(&code)
                        }
                    };

                    if edge {
                        self.source_key(code, pressed);
                    }
                }
                evdev::EV_REL => match channel.code {
                    evdev::REL_X => motion.x += channel.value,
                    evdev::REL_Y => motion.y += channel.value,
                    evdev::REL_HWHEEL => scroll_detents.x += channel.value,
                    evdev::REL_WHEEL => scroll_detents.y += channel.value,
                    _ => trace!(code = channel.code, "ignoring relative axis"),
                },
                evdev::EV_ABS => {
                    let abs = absolute.get_or_insert(DVec2::ZERO);
                    match channel.code {
                        evdev::ABS_X => abs.x = channel.value,
                        evdev::ABS_Y => abs.y = channel.value,
                        _ => trace!(code = channel.code, "ignoring absolute axis"),
                    }
                }
                _ => warn!(kind = channel.kind, code = channel.code, "unknown event channel"),
            }
        }

        // Wheel detents are fractional; one detent scrolls 15 units.
        if scroll_detents != DVec2::ZERO {
            scroll += scroll_detents * 15.0;
        }

        if let Some(abs) = absolute {
            self.pointer_absolute(abs);
        }
        if motion != DVec2::ZERO {
            self.pointer_motion_relative(motion);
        }
        if scroll != DVec2::ZERO {
            self.pointer_axis(scroll, scroll_detents);
        }
    }

    /// A source's key edge: route to the pointer's or keyboard's counting
    /// set, then to hotkeys or the focused client.
    fn source_key(&mut self, code: u16, pressed: bool) {
        if (evdev::BTN_MOUSE..=evdev::BTN_TASK).contains(&code) {
            self.pointer_button(code, pressed);
        } else if code <= evdev::KEY_MAX {
            self.keyboard_key(code, pressed);
        }
    }

    fn keyboard_key(&mut self, code: u16, pressed: bool) {
        let edge = if pressed {
            self.seat.keyboard.pressed.inc(code)
        } else {
            self.seat.keyboard.pressed.dec(code)
        };
        if !edge {
            return;
        }

        let changed = self.seat.keyboard.xkb.update_key(code, pressed);

        let hotkey = if pressed {
            let active = self.seat.keyboard.xkb.pressed_modifiers();
            self.hotkeys.press(active, code)
        } else {
            self.hotkeys.release(code)
        };

        if let Some(action) = hotkey {
            self.hotkey_triggered(action, pressed);
        } else {
            self.seat_keyboard_key(code, pressed);
        }

        if changed != 0 {
            self.seat_keyboard_modifiers();
        }
    }

    fn hotkey_triggered(&mut self, action: HotkeyAction, pressed: bool) {
        debug!(?action, pressed, "hotkey");
        if !pressed {
            return;
        }

        match action {
            HotkeyAction::CloseWindow => {
                if let Some(focus) = self.seat.keyboard.focus {
                    let root = self.subsurface_root(focus);
                    self.toplevel_close(root);
                }
            }
            HotkeyAction::Terminate => {
                self.shutdown_requested = true;
            }
        }
    }
}

/// Parses a config binding like "mod+shift+q" into its modifier set and
/// evdev code.
pub fn parse_hotkey(binding: &str) -> Option<(Modifiers, u16)> {
    let mut mods = Modifiers::NONE;
    let mut code = None;

    for part in binding.split('+') {
        let part = part.trim().to_ascii_lowercase();
        if let Some(modifier) = Modifiers::from_name(&part) {
            mods = mods.union(modifier);
        } else if code.is_none() {
            code = key_code_by_name(&part);
        } else {
            return None;
        }
    }

    code.map(|code| (mods, code))
}

fn key_code_by_name(name: &str) -> Option<u16> {
    const LETTER_ROW1: &[u8] = b"qwertyuiop";
    const LETTER_ROW2: &[u8] = b"asdfghjkl";
    const LETTER_ROW3: &[u8] = b"zxcvbnm";

    if name.len() == 1 {
        let ch = name.as_bytes()[0];

        if let Some(i) = LETTER_ROW1.iter().position(|c| *c == ch) {
            return Some(16 + i as u16);
        }
        if let Some(i) = LETTER_ROW2.iter().position(|c| *c == ch) {
            return Some(30 + i as u16);
        }
        if let Some(i) = LETTER_ROW3.iter().position(|c| *c == ch) {
            return Some(44 + i as u16);
        }
        if ch.is_ascii_digit() {
            // The digit row starts at KEY_1; zero wraps to the end.
            return Some(if ch == b'0' { 11 } else { 2 + (ch - b'1') as u16 });
        }

        return None;
    }

    match name {
        "esc" | "escape" => Some(evdev::KEY_ESC),
        "tab" => Some(evdev::KEY_TAB),
        "enter" | "return" => Some(evdev::KEY_ENTER),
        "space" => Some(evdev::KEY_SPACE),
        _ => {
            // f1 through f12.
            let n: u16 = name.strip_prefix('f')?.parse().ok()?;
            match n {
                1..=10 => Some(evdev::KEY_F1 + n - 1),
                11 => Some(evdev::KEY_F11),
                12 => Some(evdev::KEY_F12),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn counting_set_edges() {
        let mut set = CountingSet::default();

        assert!(set.inc(30));
        assert!(!set.inc(30));
        assert!(!set.dec(30));
        assert!(set.dec(30));
        assert!(!set.dec(30));
        assert!(set.is_empty());
    }

    #[test]
    fn hotkey_exact_match() {
        let mut hotkeys = Hotkeys {
            main_mod: Modifiers::ALT,
            ..Hotkeys::default()
        };
        assert!(hotkeys.bind(Modifiers::MOD, 16, HotkeyAction::CloseWindow));

        // Pressing alt+q matches mod+q through main-mod folding.
        assert_eq!(
            hotkeys.press(Modifiers::ALT, 16),
            Some(HotkeyAction::CloseWindow)
        );
        assert_eq!(hotkeys.release(16), Some(HotkeyAction::CloseWindow));

        // Extra modifiers break the exact match...
        assert_eq!(hotkeys.press(Modifiers::ALT.union(Modifiers::SHIFT), 16), None);

        // ...but lock-class modifiers are ignored.
        assert_eq!(
            hotkeys.press(Modifiers::ALT.union(Modifiers::CAPS), 16),
            Some(HotkeyAction::CloseWindow)
        );
        hotkeys.release(16);
    }

    #[test]
    fn hotkey_release_fires_after_modifier_change() {
        let mut hotkeys = Hotkeys {
            main_mod: Modifiers::ALT,
            ..Hotkeys::default()
        };
        hotkeys.bind(Modifiers::MOD, 16, HotkeyAction::Terminate);

        assert_eq!(hotkeys.press(Modifiers::ALT, 16), Some(HotkeyAction::Terminate));

        // The modifier was released before the key; the chord release is
        // still reported.
        assert_eq!(hotkeys.release(16), Some(HotkeyAction::Terminate));
        assert_eq!(hotkeys.release(16), None);
    }

    #[test]
    fn duplicate_binding_rejected() {
        let mut hotkeys = Hotkeys::default();
        assert!(hotkeys.bind(Modifiers::CTRL, 16, HotkeyAction::CloseWindow));
        assert!(!hotkeys.bind(Modifiers::CTRL, 16, HotkeyAction::Terminate));
    }

    #[test]
    fn parse_bindings() {
        assert_eq!(parse_hotkey("mod+q"), Some((Modifiers::MOD, 16)));
        assert_eq!(
            parse_hotkey("ctrl+shift+f4"),
            Some((Modifiers::CTRL.union(Modifiers::SHIFT), 62))
        );
        assert_eq!(parse_hotkey("super+0"), Some((Modifiers::SUPER, 11)));
        assert_eq!(parse_hotkey("mod+unknownkey"), None);
    }
}
