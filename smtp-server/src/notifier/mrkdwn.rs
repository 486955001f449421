//! Renders HTML mail bodies as Slack mrkdwn.
//!
//! Only the common inline and block elements are mapped: bold, italics,
//! strikethrough, code, links, headings, lists, paragraphs and line breaks.
//! Every other tag is dropped and its text kept. `script`, `style`, `head`
//! and `title` contents are skipped.

/// Escapes the characters Slack reserves for its own markup.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    text.chars().for_each(|c| push_escaped(&mut out, c));
    out
}

fn push_escaped(out: &mut String, c: char) {
    match c {
        '&' => out.push_str("&amp;"),
        '<' => out.push_str("&lt;"),
        '>' => out.push_str("&gt;"),
        _ => out.push(c),
    }
}

/// Converts `html` to escaped mrkdwn. The only unescaped `<` in the output
/// open `<url|text>` links.
pub fn html_to_mrkdwn(html: &str) -> String {
    let mut renderer = Renderer::default();
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        renderer.text(&rest[..open]);
        let after = &rest[open + 1..];

        if let Some(comment) = after.strip_prefix("!--") {
            rest = comment.find("-->").map_or("", |end| &comment[end + 3..]);
            continue;
        }

        match after.find('>') {
            Some(close) if after.starts_with(opens_tag) => {
                renderer.tag(&after[..close]);
                rest = &after[close + 1..];
            }
            _ => {
                renderer.text("<");
                rest = after;
            }
        }
    }
    renderer.text(rest);

    renderer.finish()
}

fn opens_tag(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '/' || c == '!'
}

#[derive(Default)]
struct Renderer {
    out: String,
    /// Depth inside elements whose content is not rendered.
    skip_depth: usize,
    pre_depth: usize,
    /// Open lists, innermost last. `Some(n)` is an ordered list at item `n`.
    lists: Vec<Option<usize>>,
    /// Open anchors, innermost last; `true` when it was rendered as a link.
    links: Vec<bool>,
}

impl Renderer {
    fn text(&mut self, raw: &str) {
        if self.skip_depth > 0 {
            return;
        }
        for c in decode_entities(raw).chars() {
            if c.is_whitespace() && self.pre_depth == 0 {
                if !self.out.is_empty() && !self.out.ends_with(|c: char| c == ' ' || c == '\n') {
                    self.out.push(' ');
                }
            } else {
                push_escaped(&mut self.out, c);
            }
        }
    }

    fn tag(&mut self, raw: &str) {
        let (closing, body) = match raw.strip_prefix('/') {
            Some(body) => (true, body),
            None => (false, raw),
        };
        let name = body
            .split(|c: char| !c.is_ascii_alphanumeric())
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();

        if matches!(name.as_str(), "script" | "style" | "head" | "title") {
            if closing {
                self.skip_depth = self.skip_depth.saturating_sub(1);
            } else if !body.ends_with('/') {
                self.skip_depth += 1;
            }
            return;
        }
        if self.skip_depth > 0 {
            return;
        }

        match (name.as_str(), closing) {
            ("b" | "strong", _) => self.out.push('*'),
            ("i" | "em", _) => self.out.push('_'),
            ("s" | "strike" | "del", _) => self.out.push('~'),
            ("code", _) if self.pre_depth == 0 => self.out.push('`'),
            ("pre", false) => {
                self.paragraph();
                self.out.push_str("```\n");
                self.pre_depth += 1;
            }
            ("pre", true) => {
                self.pre_depth = self.pre_depth.saturating_sub(1);
                self.line_break();
                self.out.push_str("```");
                self.paragraph();
            }
            ("br", _) => {
                self.trim_trailing_spaces();
                self.out.push('\n');
            }
            ("p", _) => self.paragraph(),
            ("h1" | "h2" | "h3" | "h4" | "h5" | "h6", false) => {
                self.paragraph();
                self.out.push('*');
            }
            ("h1" | "h2" | "h3" | "h4" | "h5" | "h6", true) => {
                self.out.push('*');
                self.paragraph();
            }
            ("ul", false) => {
                self.line_break();
                self.lists.push(None);
            }
            ("ol", false) => {
                self.line_break();
                self.lists.push(Some(1));
            }
            ("ul" | "ol", true) => {
                self.lists.pop();
                self.line_break();
            }
            ("li", false) => self.list_item(),
            ("a", false) => self.open_link(body),
            ("a", true) => {
                if self.links.pop() == Some(true) {
                    self.out.push('>');
                }
            }
            ("td" | "th", true) => self.out.push(' '),
            ("div" | "li" | "tr" | "table" | "blockquote" | "hr", _) => self.line_break(),
            _ => {}
        }
    }

    fn list_item(&mut self) {
        self.line_break();
        let depth = self.lists.len().saturating_sub(1);
        self.out.push_str(&"  ".repeat(depth));
        match self.lists.last_mut() {
            Some(Some(n)) => {
                self.out.push_str(&format!("{n}. "));
                *n += 1;
            }
            _ => self.out.push_str("• "),
        }
    }

    fn open_link(&mut self, tag: &str) {
        let href = attribute(tag, "href").filter(|href| {
            !href.is_empty()
                && !href.starts_with('#')
                && !href.contains(|c| matches!(c, '|' | '<' | '>'))
        });
        match href {
            Some(href) => {
                self.out.push('<');
                self.out.push_str(&escape(&href));
                self.out.push('|');
                self.links.push(true);
            }
            None => self.links.push(false),
        }
    }

    fn trim_trailing_spaces(&mut self) {
        let len = self.out.trim_end_matches(' ').len();
        self.out.truncate(len);
    }

    fn line_break(&mut self) {
        self.trim_trailing_spaces();
        if !self.out.is_empty() && !self.out.ends_with('\n') {
            self.out.push('\n');
        }
    }

    fn paragraph(&mut self) {
        self.line_break();
        if !self.out.is_empty() && !self.out.ends_with("\n\n") {
            self.out.push('\n');
        }
    }

    fn finish(mut self) -> String {
        for rendered in std::mem::take(&mut self.links) {
            if rendered {
                self.out.push('>');
            }
        }

        let mut result = String::with_capacity(self.out.len());
        let mut blank = false;
        for line in self.out.lines().map(str::trim_end) {
            if line.is_empty() && blank {
                continue;
            }
            blank = line.is_empty();
            result.push_str(line);
            result.push('\n');
        }
        result.trim().to_string()
    }
}

/// Value of attribute `name` inside the tag text, entities decoded.
fn attribute(tag: &str, name: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets, so positions in `lower` index `tag`.
    let lower = tag.to_ascii_lowercase();
    let mut from = 0;
    while let Some(pos) = lower[from..].find(name) {
        let start = from + pos;
        from = start + name.len();
        if start == 0 || !lower.as_bytes()[start - 1].is_ascii_whitespace() {
            continue;
        }
        let Some(value) = tag[from..].trim_start().strip_prefix('=') else {
            continue;
        };
        let value = value.trim_start();
        let value = match value.chars().next() {
            Some(quote @ ('"' | '\'')) => value[1..].split(quote).next().unwrap_or(""),
            _ => value.split(char::is_whitespace).next().unwrap_or(""),
        };
        return Some(decode_entities(value));
    }
    None
}

fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest
            .find(';')
            .filter(|end| *end <= 10)
            .and_then(|end| entity(&rest[1..end]).map(|c| (c, end)));
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let code = name.strip_prefix('#')?;
            let value = match code.strip_prefix('x').or_else(|| code.strip_prefix('X')) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => code.parse().ok()?,
            };
            char::from_u32(value)
        }
    }
}
