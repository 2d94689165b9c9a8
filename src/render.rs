use std::fmt::Write;

/// Wraps every line of `text` to at most `width` characters, breaking at
/// whitespace. Existing line breaks are kept, runs of whitespace inside a
/// line collapse to one space, and words longer than `width` are split.
/// A width of zero leaves the text as it is.
pub fn wrap_text(text: &str, width: usize) -> String {
    if width == 0 {
        return text.to_string();
    }
    text.split('\n')
        .map(|line| wrap_line(line, width))
        .collect::<Vec<_>>()
        .join("\n")
}

fn wrap_line(line: &str, width: usize) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in line.split_whitespace() {
        let mut chars: Vec<char> = word.chars().collect();

        // start a new line if the word doesn't fit after a space
        if current_len > 0 && current_len + 1 + chars.len() > width {
            lines.push(std::mem::take(&mut current));
            current_len = 0;
        }

        while current_len == 0 && chars.len() > width {
            let rest = chars.split_off(width);
            lines.push(chars.into_iter().collect());
            chars = rest;
        }

        if chars.is_empty() {
            continue;
        }
        if current_len > 0 {
            current.push(' ');
            current_len += 1;
        }
        current.extend(chars.iter());
        current_len += chars.len();
    }

    if current_len > 0 {
        lines.push(current);
    }
    lines.join("\n")
}

/// Formats completion answers for the terminal. A single answer is headed
/// `Answer:`, several are numbered `Answer 1:`, `Answer 2:`, ...
pub fn format_answers(answers: &[String], width: usize) -> String {
    let mut out = String::new();
    for (i, answer) in answers.iter().enumerate() {
        if answers.len() == 1 {
            out.push_str("\nAnswer:\n");
        } else {
            let _ = writeln!(out, "\nAnswer {}:", i + 1);
        }
        let _ = writeln!(out, "\n{}", wrap_text(answer, width));
    }
    out
}
