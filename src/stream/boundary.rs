/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

const CDATA_OPEN: &[u8] = b"CDATA[";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lex {
    Text,
    /// After `<`.
    Open,
    Start { quote: Option<u8>, slash: bool },
    End { quote: Option<u8> },
    /// After `<!`.
    Bang,
    /// After `<!-`.
    BangDash,
    /// After `<![` and this many bytes of `CDATA[`.
    CDataOpen(usize),
    Comment { dashes: u8 },
    CData { brackets: u8 },
    /// Declarations such as `<!DOCTYPE`.
    Declaration { quote: Option<u8> },
    Pi { question: bool },
}

/// Byte-level tracker of element depth over the pending input.
///
/// It finds the points where a top-level item may have been completed, so
/// the full parse runs once per item instead of once per network read.
/// Each byte is looked at once; the state survives between reads.
#[derive(Debug, Clone)]
pub(super) struct Boundary {
    checked: usize,
    depth: usize,
    lex: Lex,
}

impl Default for Boundary {
    fn default() -> Self {
        Boundary {
            checked: 0,
            depth: 0,
            lex: Lex::Text,
        }
    }
}

impl Boundary {
    /// Starts over at a top-level boundary.
    pub(super) fn reset(&mut self) {
        *self = Boundary::default();
    }

    /// Scans the not yet seen part of `pending` and stops right after a byte
    /// which may complete a top-level item. `expect_root` makes a top-level
    /// start tag count, as it may be the stream header.
    pub(super) fn advance(&mut self, pending: &[u8], expect_root: bool) -> bool {
        while self.checked < pending.len() {
            let byte = pending[self.checked];
            self.checked += 1;
            if self.step(byte, expect_root) {
                return true;
            }
        }
        false
    }

    fn step(&mut self, byte: u8, expect_root: bool) -> bool {
        match self.lex {
            Lex::Text => {
                if byte == b'<' {
                    self.lex = Lex::Open;
                    return false;
                }
                // Keep-alive whitespace or stray text, both need the parser
                self.depth == 0
            }
            Lex::Open => {
                self.lex = match byte {
                    b'/' => Lex::End { quote: None },
                    b'!' => Lex::Bang,
                    b'?' => Lex::Pi { question: false },
                    _ => Lex::Start {
                        quote: None,
                        slash: false,
                    },
                };
                false
            }
            Lex::Start { quote: Some(q), slash } => {
                if byte == q {
                    self.lex = Lex::Start { quote: None, slash };
                }
                false
            }
            Lex::Start { quote: None, .. } => match byte {
                b'\'' | b'"' => {
                    self.lex = Lex::Start {
                        quote: Some(byte),
                        slash: false,
                    };
                    false
                }
                b'>' => {
                    let empty = matches!(self.lex, Lex::Start { slash: true, .. });
                    self.lex = Lex::Text;
                    if empty {
                        self.depth == 0
                    } else {
                        self.depth += 1;
                        self.depth == 1 && expect_root
                    }
                }
                _ => {
                    self.lex = Lex::Start {
                        quote: None,
                        slash: byte == b'/',
                    };
                    false
                }
            },
            Lex::End { quote: Some(q) } => {
                if byte == q {
                    self.lex = Lex::End { quote: None };
                }
                false
            }
            Lex::End { quote: None } => match byte {
                b'\'' | b'"' => {
                    self.lex = Lex::End { quote: Some(byte) };
                    false
                }
                b'>' => {
                    self.lex = Lex::Text;
                    if self.depth == 0 {
                        // Closes the stream root, or is an error
                        return true;
                    }
                    self.depth -= 1;
                    self.depth == 0
                }
                _ => false,
            },
            Lex::Bang => {
                self.lex = match byte {
                    b'-' => Lex::BangDash,
                    b'[' => Lex::CDataOpen(0),
                    _ => Lex::Declaration { quote: None },
                };
                false
            }
            Lex::BangDash => {
                self.lex = if byte == b'-' {
                    Lex::Comment { dashes: 0 }
                } else {
                    Lex::Declaration { quote: None }
                };
                false
            }
            Lex::CDataOpen(matched) => {
                self.lex = if byte != CDATA_OPEN[matched] {
                    Lex::Declaration { quote: None }
                } else if matched + 1 == CDATA_OPEN.len() {
                    Lex::CData { brackets: 0 }
                } else {
                    Lex::CDataOpen(matched + 1)
                };
                false
            }
            Lex::Comment { dashes } => {
                self.lex = match byte {
                    b'>' if dashes >= 2 => Lex::Text,
                    b'-' => Lex::Comment {
                        dashes: dashes.saturating_add(1),
                    },
                    _ => Lex::Comment { dashes: 0 },
                };
                false
            }
            Lex::CData { brackets } => {
                self.lex = match byte {
                    b'>' if brackets >= 2 => Lex::Text,
                    b']' => Lex::CData {
                        brackets: brackets.saturating_add(1),
                    },
                    _ => Lex::CData { brackets: 0 },
                };
                false
            }
            Lex::Declaration { quote: Some(q) } => {
                if byte == q {
                    self.lex = Lex::Declaration { quote: None };
                }
                false
            }
            Lex::Declaration { quote: None } => {
                match byte {
                    b'\'' | b'"' => self.lex = Lex::Declaration { quote: Some(byte) },
                    b'>' => self.lex = Lex::Text,
                    _ => {}
                }
                false
            }
            Lex::Pi { question } => {
                self.lex = match byte {
                    b'>' if question => Lex::Text,
                    _ => Lex::Pi {
                        question: byte == b'?',
                    },
                };
                false
            }
        }
    }
}
