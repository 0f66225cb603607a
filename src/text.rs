use unicode_segmentation::UnicodeSegmentation;

use crate::kinopoisk::Film;
use crate::storage::StoredMovie;

pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Обрезка по графемам, чтобы не разорвать эмодзи и составные символы.
pub fn clip(s: &str, max: usize) -> String {
    let mut graphemes = s.graphemes(true);
    let head: String = graphemes.by_ref().take(max).collect();
    if graphemes.next().is_some() { head + "…" } else { head }
}

pub fn split_by_chars(s: &str, max: usize) -> Vec<String> {
    if s.chars().count() <= max { return vec![s.to_string()]; }
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut n = 0;
    for ch in s.chars() {
        if n >= max {
            out.push(std::mem::take(&mut cur));
            n = 0;
        }
        cur.push(ch);
        n += 1;
    }
    if !cur.is_empty() { out.push(cur); }
    out
}

pub fn join_blocks(blocks: Vec<String>, limit_hint: usize) -> String {
    let mut out = String::new();
    for b in blocks {
        let piece = if out.is_empty() { b } else { format!("\n\n{}", b) };
        let over = out.chars().count() + piece.chars().count() > limit_hint;
        // не влезающий блок всё равно кладём, дальше порежет split_by_chars
        out.push_str(&piece);
        if over { break; }
    }
    out
}

pub fn one_line_title(title: &str, year: Option<i32>) -> String {
    match year {
        Some(y) => format!("{} ({})", title, y),
        None => title.to_string(),
    }
}

/// «1 фильм», «3 фильма», «11 фильмов».
pub fn with_count(n: usize, one: &str, few: &str, many: &str) -> String {
    let word = match (n % 10, n % 100) {
        (_, 11..=14) => many,
        (1, _) => one,
        (2..=4, _) => few,
        _ => many,
    };
    format!("{n} {word}")
}

pub fn stored_title(m: &StoredMovie) -> String {
    one_line_title(&m.title, m.year)
}

pub fn film_block(f: &Film, overview_limit: usize) -> String {
    let title = html_escape(&one_line_title(&f.title, f.year));
    let body = match f.description.as_deref().map(str::trim) {
        Some(d) if !d.is_empty() => html_escape(&clip(d, overview_limit)),
        _ => "<i>нет описания</i>".to_string(),
    };
    let rating = f.rating.map(|r| format!(" ⭐ {r:.1}")).unwrap_or_default();
    let serial = if f.serial { " 📺" } else { "" };
    format!("<b>{}</b>{}{}\n\n{}", title, serial, rating, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_keeps_short_strings() {
        assert_eq!(clip("кино", 10), "кино");
        assert_eq!(clip("кинотеатр", 4), "кино…");
        assert_eq!(clip("👨‍👩‍👧 семья", 1), "👨‍👩‍👧…");
    }

    #[test]
    fn split_respects_char_budget() {
        let parts = split_by_chars("абвгд", 2);
        assert_eq!(parts, vec!["аб", "вг", "д"]);
        assert_eq!(split_by_chars("ab", 5), vec!["ab"]);
    }

    #[test]
    fn russian_plurals() {
        let f = |n| with_count(n, "фильм", "фильма", "фильмов");
        assert_eq!(f(1), "1 фильм");
        assert_eq!(f(3), "3 фильма");
        assert_eq!(f(11), "11 фильмов");
        assert_eq!(f(22), "22 фильма");
        assert_eq!(f(0), "0 фильмов");
    }

    #[test]
    fn block_escapes_html() {
        let f = Film {
            id: 1,
            title: "<Тест>".into(),
            original_title: None,
            year: Some(2001),
            description: Some("a & b".into()),
            poster_url: None,
            rating: Some(7.3),
            serial: false,
        };
        let block = film_block(&f, 100);
        assert!(block.starts_with("<b>&lt;Тест&gt; (2001)</b> ⭐ 7.3"));
        assert!(block.ends_with("a &amp; b"));
    }
}
