// Copyright 2025 ikvmd Authors
// SPDX-License-Identifier: Apache-2.0

//! Keysym translation tables
//!
//! Pure, stateless mapping from RFB keysyms to USB HID usage codes and
//! modifier bits. A keysym that maps to usage 0 is either a modifier
//! (resolved by [`keysym_to_modifier`]) or unknown and dropped.

/// X11 keysym values as they appear on the RFB wire.
pub mod keysyms {
    pub const XK_BACKSPACE: u32 = 0xff08;
    pub const XK_TAB: u32 = 0xff09;
    pub const XK_RETURN: u32 = 0xff0d;
    pub const XK_PAUSE: u32 = 0xff13;
    pub const XK_SCROLL_LOCK: u32 = 0xff14;
    pub const XK_ESCAPE: u32 = 0xff1b;
    pub const XK_HOME: u32 = 0xff50;
    pub const XK_LEFT: u32 = 0xff51;
    pub const XK_UP: u32 = 0xff52;
    pub const XK_RIGHT: u32 = 0xff53;
    pub const XK_DOWN: u32 = 0xff54;
    pub const XK_PAGE_UP: u32 = 0xff55;
    pub const XK_PAGE_DOWN: u32 = 0xff56;
    pub const XK_END: u32 = 0xff57;
    pub const XK_PRINT: u32 = 0xff61;
    pub const XK_INSERT: u32 = 0xff63;
    pub const XK_NUM_LOCK: u32 = 0xff7f;
    pub const XK_KP_SPACE: u32 = 0xff80;
    pub const XK_KP_TAB: u32 = 0xff89;
    pub const XK_KP_ENTER: u32 = 0xff8d;
    pub const XK_KP_F1: u32 = 0xff91;
    pub const XK_KP_F4: u32 = 0xff94;
    pub const XK_KP_HOME: u32 = 0xff95;
    pub const XK_KP_LEFT: u32 = 0xff96;
    pub const XK_KP_UP: u32 = 0xff97;
    pub const XK_KP_RIGHT: u32 = 0xff98;
    pub const XK_KP_DOWN: u32 = 0xff99;
    pub const XK_KP_PAGE_UP: u32 = 0xff9a;
    pub const XK_KP_PAGE_DOWN: u32 = 0xff9b;
    pub const XK_KP_END: u32 = 0xff9c;
    pub const XK_KP_INSERT: u32 = 0xff9e;
    pub const XK_KP_DELETE: u32 = 0xff9f;
    pub const XK_KP_MULTIPLY: u32 = 0xffaa;
    pub const XK_KP_ADD: u32 = 0xffab;
    pub const XK_KP_SUBTRACT: u32 = 0xffad;
    pub const XK_KP_DECIMAL: u32 = 0xffae;
    pub const XK_KP_DIVIDE: u32 = 0xffaf;
    pub const XK_KP_0: u32 = 0xffb0;
    pub const XK_KP_1: u32 = 0xffb1;
    pub const XK_KP_9: u32 = 0xffb9;
    pub const XK_KP_EQUAL: u32 = 0xffbd;
    pub const XK_F1: u32 = 0xffbe;
    pub const XK_F12: u32 = 0xffc9;
    pub const XK_SHIFT_L: u32 = 0xffe1;
    pub const XK_CONTROL_R: u32 = 0xffe4;
    pub const XK_CAPS_LOCK: u32 = 0xffe5;
    pub const XK_META_L: u32 = 0xffe7;
    pub const XK_ALT_R: u32 = 0xffea;
    pub const XK_DELETE: u32 = 0xffff;
}

/// USB HID keyboard usage codes (usage page 0x07).
pub mod usage {
    pub const KEY_A: u8 = 0x04;
    pub const KEY_1: u8 = 0x1e;
    pub const KEY_2: u8 = 0x1f;
    pub const KEY_3: u8 = 0x20;
    pub const KEY_4: u8 = 0x21;
    pub const KEY_5: u8 = 0x22;
    pub const KEY_6: u8 = 0x23;
    pub const KEY_7: u8 = 0x24;
    pub const KEY_8: u8 = 0x25;
    pub const KEY_9: u8 = 0x26;
    pub const KEY_0: u8 = 0x27;
    pub const KEY_RETURN: u8 = 0x28;
    pub const KEY_ESC: u8 = 0x29;
    pub const KEY_BACKSPACE: u8 = 0x2a;
    pub const KEY_TAB: u8 = 0x2b;
    pub const KEY_SPACE: u8 = 0x2c;
    pub const KEY_MINUS: u8 = 0x2d;
    pub const KEY_EQUAL: u8 = 0x2e;
    pub const KEY_LEFTBRACE: u8 = 0x2f;
    pub const KEY_RIGHTBRACE: u8 = 0x30;
    pub const KEY_BACKSLASH: u8 = 0x31;
    pub const KEY_SEMICOLON: u8 = 0x33;
    pub const KEY_APOSTROPHE: u8 = 0x34;
    pub const KEY_GRAVE: u8 = 0x35;
    pub const KEY_COMMA: u8 = 0x36;
    pub const KEY_DOT: u8 = 0x37;
    pub const KEY_SLASH: u8 = 0x38;
    pub const KEY_CAPSLOCK: u8 = 0x39;
    pub const KEY_F1: u8 = 0x3a;
    pub const KEY_PRINT: u8 = 0x46;
    pub const KEY_SCROLLLOCK: u8 = 0x47;
    pub const KEY_PAUSE: u8 = 0x48;
    pub const KEY_INSERT: u8 = 0x49;
    pub const KEY_HOME: u8 = 0x4a;
    pub const KEY_PAGEUP: u8 = 0x4b;
    pub const KEY_DELETE: u8 = 0x4c;
    pub const KEY_END: u8 = 0x4d;
    pub const KEY_PAGEDOWN: u8 = 0x4e;
    pub const KEY_RIGHT: u8 = 0x4f;
    pub const KEY_LEFT: u8 = 0x50;
    pub const KEY_DOWN: u8 = 0x51;
    pub const KEY_UP: u8 = 0x52;
    pub const KEY_NUMLOCK: u8 = 0x53;
    pub const KEY_KP_SLASH: u8 = 0x54;
    pub const KEY_KP_ASTERISK: u8 = 0x55;
    pub const KEY_KP_MINUS: u8 = 0x56;
    pub const KEY_KP_PLUS: u8 = 0x57;
    pub const KEY_KP_ENTER: u8 = 0x58;
    pub const KEY_KP_1: u8 = 0x59;
    pub const KEY_KP_0: u8 = 0x62;
    pub const KEY_KP_DOT: u8 = 0x63;
    pub const KEY_KP_EQUAL: u8 = 0x67;
}

use keysyms::*;
use usage::*;

/// HID modifier bits for the Shift_L..Control_R keysym range.
const SHIFT_CTRL_MAP: [u8; 4] = [
    0x02, // left shift
    0x20, // right shift
    0x01, // left control
    0x10, // right control
];

/// HID modifier bits for the Meta_L..Alt_R keysym range.
const META_ALT_MAP: [u8; 4] = [
    0x08, // left meta
    0x80, // right meta
    0x04, // left alt
    0x40, // right alt
];

/// Translate a keysym to its HID modifier bit, or 0 for non-modifiers.
pub fn keysym_to_modifier(key: u32) -> u8 {
    if (XK_SHIFT_L..=XK_CONTROL_R).contains(&key) {
        SHIFT_CTRL_MAP[(key - XK_SHIFT_L) as usize]
    } else if (XK_META_L..=XK_ALT_R).contains(&key) {
        META_ALT_MAP[(key - XK_META_L) as usize]
    } else {
        0
    }
}

/// Translate a keysym to a HID usage code, or 0 for modifiers and
/// unrecognized keysyms.
///
/// Shifted-digit punctuation maps to the bare digit usage; the host
/// kernel applies the shift state from the modifier byte. Keypad
/// editing keys alias to their non-keypad counterparts.
pub fn keysym_to_scancode(key: u32) -> u8 {
    if matches!(key, 0x41..=0x5a | 0x61..=0x7a) {
        return KEY_A + ((key & 0x5f) as u8 - b'A');
    }
    if (0x31..=0x39).contains(&key) {
        return KEY_1 + (key as u8 - b'1');
    }
    if (XK_F1..=XK_F12).contains(&key) {
        return KEY_F1 + (key - XK_F1) as u8;
    }
    if (XK_KP_F1..=XK_KP_F4).contains(&key) {
        return KEY_F1 + (key - XK_KP_F1) as u8;
    }
    if (XK_KP_1..=XK_KP_9).contains(&key) {
        return KEY_KP_1 + (key - XK_KP_1) as u8;
    }

    match key {
        0x21 => KEY_1,        // exclam
        0x40 => KEY_2,        // at
        0x23 => KEY_3,        // numbersign
        0x24 => KEY_4,        // dollar
        0x25 => KEY_5,        // percent
        0x5e => KEY_6,        // asciicircum
        0x26 => KEY_7,        // ampersand
        0x2a => KEY_8,        // asterisk
        0x28 => KEY_9,        // parenleft
        0x30 | 0x29 => KEY_0, // '0', parenright
        XK_RETURN => KEY_RETURN,
        XK_ESCAPE => KEY_ESC,
        XK_BACKSPACE => KEY_BACKSPACE,
        XK_TAB | XK_KP_TAB => KEY_TAB,
        0x20 | XK_KP_SPACE => KEY_SPACE,
        0x2d | 0x5f => KEY_MINUS,        // minus, underscore
        0x2b | 0x3d => KEY_EQUAL,        // plus, equal
        0x5b | 0x7b => KEY_LEFTBRACE,    // bracketleft, braceleft
        0x5d | 0x7d => KEY_RIGHTBRACE,   // bracketright, braceright
        0x5c | 0x7c => KEY_BACKSLASH,    // backslash, bar
        0x3a | 0x3b => KEY_SEMICOLON,    // colon, semicolon
        0x22 | 0x27 => KEY_APOSTROPHE,   // quotedbl, apostrophe
        0x60 | 0x7e => KEY_GRAVE,        // grave, asciitilde
        0x2c | 0x3c => KEY_COMMA,        // comma, less
        0x2e | 0x3e => KEY_DOT,          // period, greater
        0x2f | 0x3f => KEY_SLASH,        // slash, question
        XK_CAPS_LOCK => KEY_CAPSLOCK,
        XK_PRINT => KEY_PRINT,
        XK_SCROLL_LOCK => KEY_SCROLLLOCK,
        XK_PAUSE => KEY_PAUSE,
        XK_INSERT | XK_KP_INSERT => KEY_INSERT,
        XK_HOME | XK_KP_HOME => KEY_HOME,
        XK_PAGE_UP | XK_KP_PAGE_UP => KEY_PAGEUP,
        XK_DELETE | XK_KP_DELETE => KEY_DELETE,
        XK_END | XK_KP_END => KEY_END,
        XK_PAGE_DOWN | XK_KP_PAGE_DOWN => KEY_PAGEDOWN,
        XK_RIGHT | XK_KP_RIGHT => KEY_RIGHT,
        XK_LEFT | XK_KP_LEFT => KEY_LEFT,
        XK_DOWN | XK_KP_DOWN => KEY_DOWN,
        XK_UP | XK_KP_UP => KEY_UP,
        XK_NUM_LOCK => KEY_NUMLOCK,
        XK_KP_ENTER => KEY_KP_ENTER,
        XK_KP_EQUAL => KEY_KP_EQUAL,
        XK_KP_MULTIPLY => KEY_KP_ASTERISK,
        XK_KP_ADD => KEY_KP_PLUS,
        XK_KP_SUBTRACT => KEY_KP_MINUS,
        XK_KP_DECIMAL => KEY_KP_DOT,
        XK_KP_DIVIDE => KEY_KP_SLASH,
        XK_KP_0 => KEY_KP_0,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letters_case_folded() {
        assert_eq!(keysym_to_scancode('a' as u32), KEY_A);
        assert_eq!(keysym_to_scancode('A' as u32), KEY_A);
        assert_eq!(keysym_to_scancode('z' as u32), KEY_A + 25);
        assert_eq!(keysym_to_scancode('Z' as u32), KEY_A + 25);
    }

    #[test]
    fn test_digits_and_shifted_punctuation() {
        assert_eq!(keysym_to_scancode('1' as u32), KEY_1);
        assert_eq!(keysym_to_scancode('9' as u32), KEY_1 + 8);
        assert_eq!(keysym_to_scancode('0' as u32), KEY_0);
        assert_eq!(keysym_to_scancode(')' as u32), KEY_0);
        // shifted digits land on the same usage as the bare digit
        assert_eq!(keysym_to_scancode('!' as u32), KEY_1);
        assert_eq!(keysym_to_scancode('@' as u32), KEY_1 + 1);
        assert_eq!(keysym_to_scancode('(' as u32), KEY_1 + 8);
    }

    #[test]
    fn test_function_keys() {
        assert_eq!(keysym_to_scancode(XK_F1), KEY_F1);
        assert_eq!(keysym_to_scancode(XK_F12), KEY_F1 + 11);
        // keypad F1..F4 alias onto F1..F4
        assert_eq!(keysym_to_scancode(XK_KP_F1), KEY_F1);
        assert_eq!(keysym_to_scancode(XK_KP_F4), KEY_F1 + 3);
    }

    #[test]
    fn test_keypad_digits_and_operators() {
        assert_eq!(keysym_to_scancode(XK_KP_1), KEY_KP_1);
        assert_eq!(keysym_to_scancode(XK_KP_9), KEY_KP_1 + 8);
        assert_eq!(keysym_to_scancode(XK_KP_0), KEY_KP_0);
        assert_eq!(keysym_to_scancode(XK_KP_ENTER), KEY_KP_ENTER);
        assert_eq!(keysym_to_scancode(XK_KP_EQUAL), KEY_KP_EQUAL);
        assert_eq!(keysym_to_scancode(XK_KP_MULTIPLY), KEY_KP_ASTERISK);
        assert_eq!(keysym_to_scancode(XK_KP_ADD), KEY_KP_PLUS);
        assert_eq!(keysym_to_scancode(XK_KP_SUBTRACT), KEY_KP_MINUS);
        assert_eq!(keysym_to_scancode(XK_KP_DECIMAL), KEY_KP_DOT);
        assert_eq!(keysym_to_scancode(XK_KP_DIVIDE), KEY_KP_SLASH);
    }

    #[test]
    fn test_keypad_editing_aliases() {
        assert_eq!(keysym_to_scancode(XK_KP_HOME), KEY_HOME);
        assert_eq!(keysym_to_scancode(XK_KP_END), KEY_END);
        assert_eq!(keysym_to_scancode(XK_KP_INSERT), KEY_INSERT);
        assert_eq!(keysym_to_scancode(XK_KP_DELETE), KEY_DELETE);
        assert_eq!(keysym_to_scancode(XK_KP_LEFT), KEY_LEFT);
        assert_eq!(keysym_to_scancode(XK_KP_PAGE_DOWN), KEY_PAGEDOWN);
        assert_eq!(keysym_to_scancode(XK_KP_TAB), KEY_TAB);
        assert_eq!(keysym_to_scancode(XK_KP_SPACE), KEY_SPACE);
    }

    #[test]
    fn test_named_keys() {
        assert_eq!(keysym_to_scancode(XK_RETURN), KEY_RETURN);
        assert_eq!(keysym_to_scancode(XK_ESCAPE), KEY_ESC);
        assert_eq!(keysym_to_scancode('-' as u32), KEY_MINUS);
        assert_eq!(keysym_to_scancode('_' as u32), KEY_MINUS);
        assert_eq!(keysym_to_scancode('|' as u32), KEY_BACKSLASH);
        assert_eq!(keysym_to_scancode('~' as u32), KEY_GRAVE);
        assert_eq!(keysym_to_scancode('?' as u32), KEY_SLASH);
        assert_eq!(keysym_to_scancode(XK_NUM_LOCK), KEY_NUMLOCK);
    }

    #[test]
    fn test_modifier_bits() {
        assert_eq!(keysym_to_modifier(XK_SHIFT_L), 0x02);
        assert_eq!(keysym_to_modifier(XK_SHIFT_L + 1), 0x20); // right shift
        assert_eq!(keysym_to_modifier(XK_SHIFT_L + 2), 0x01); // left ctrl
        assert_eq!(keysym_to_modifier(XK_CONTROL_R), 0x10);
        assert_eq!(keysym_to_modifier(XK_META_L), 0x08);
        assert_eq!(keysym_to_modifier(XK_META_L + 1), 0x80); // right meta
        assert_eq!(keysym_to_modifier(XK_META_L + 2), 0x04); // left alt
        assert_eq!(keysym_to_modifier(XK_ALT_R), 0x40);
    }

    #[test]
    fn test_modifiers_have_no_scancode() {
        assert_eq!(keysym_to_scancode(XK_SHIFT_L), 0);
        assert_eq!(keysym_to_scancode(XK_ALT_R), 0);
    }

    #[test]
    fn test_unknown_keysym_dropped() {
        assert_eq!(keysym_to_scancode(0xfffe), 0);
        assert_eq!(keysym_to_scancode(0x10ffff), 0);
        assert_eq!(keysym_to_modifier(0x41), 0);
    }
}
