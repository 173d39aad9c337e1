use pulldown_cmark::{Event, Parser, Tag, TagEnd};

/// Render markdown as plain text for destinations that show it verbatim.
/// Emphasis markers are dropped, list items become bullets and link
/// targets follow their text in parentheses.
pub fn markdown_to_plain(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len());
    let mut link_stack: Vec<String> = Vec::new();
    let mut list_depth = 0usize;

    for event in Parser::new(markdown) {
        match event {
            Event::Text(text) | Event::Code(text) => out.push_str(&text),
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            Event::Start(Tag::List(_)) => {
                if list_depth == 0 {
                    ensure_blank_line(&mut out);
                }
                list_depth += 1;
            }
            Event::End(TagEnd::List(_)) => {
                list_depth = list_depth.saturating_sub(1);
                if list_depth == 0 {
                    out.push('\n');
                }
            }
            Event::Start(Tag::Item) => {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&"  ".repeat(list_depth.saturating_sub(1)));
                out.push_str("• ");
            }
            Event::Start(Tag::Link { dest_url, .. }) => link_stack.push(dest_url.to_string()),
            Event::End(TagEnd::Link) => {
                if let Some(url) = link_stack.pop()
                    && !out.ends_with(url.as_str())
                {
                    out.push_str(&format!(" ({url})"));
                }
            }
            Event::Start(Tag::Paragraph) | Event::Start(Tag::Heading { .. }) | Event::Start(Tag::BlockQuote(_)) => {
                if list_depth == 0 {
                    ensure_blank_line(&mut out);
                }
            }
            Event::Start(Tag::CodeBlock(_)) => ensure_blank_line(&mut out),
            Event::Rule => {
                ensure_blank_line(&mut out);
                out.push_str("———");
            }
            _ => {}
        }
    }

    out.trim().to_string()
}

fn ensure_blank_line(out: &mut String) {
    if out.is_empty() {
        return;
    }
    while !out.ends_with("\n\n") {
        out.push('\n');
    }
}
