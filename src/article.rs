//! Article segmentation for agreement text.
//!
//! Collective agreements are organized as numbered articles
//! ("Artikel 12", "Art. 12a", "§ 12"). Segmentation finds those headings
//! and yields one span per article, keeping byte offsets into the source
//! text so chunk offsets stay document-relative.

use regex::Regex;

/// One article's slice of the document text.
#[derive(Debug, Clone)]
pub struct ArticleSpan {
    pub number: String,
    pub title: Option<String>,
    pub text: String,
    /// Byte offset of the article body in the document text.
    pub start_offset: usize,
    pub end_offset: usize,
}

fn heading_regex() -> Regex {
    // Heading forms: "Artikel 5", "Art. 5a:", "Article 5 - Title", "§ 5".
    // The separator class must not cross the newline, or a title-less
    // heading would swallow the first body line as its title.
    Regex::new(r"(?mi)^[ \t]*(artikel|art\.|article|§)[ \t]+(\d+[a-z]?)[ \t:.-]*(.*)$")
        .expect("article heading pattern is valid")
}

/// Split document text into article spans.
///
/// A document with fewer than two recognizable headings is treated as a
/// single article numbered "1"; short side letters and appendices come
/// through this path.
pub fn segment(text: &str) -> Vec<ArticleSpan> {
    let re = heading_regex();
    let headings: Vec<(usize, usize, String, Option<String>)> = re
        .captures_iter(text)
        .map(|cap| {
            let whole = cap.get(0).expect("capture group 0 always present");
            let number = cap[2].to_lowercase();
            let title_raw = cap[3].trim();
            let title = if title_raw.is_empty() {
                None
            } else {
                Some(title_raw.to_string())
            };
            (whole.start(), whole.end(), number, title)
        })
        .collect();

    if headings.len() < 2 {
        return vec![ArticleSpan {
            number: "1".to_string(),
            title: None,
            text: text.to_string(),
            start_offset: 0,
            end_offset: text.len(),
        }];
    }

    let mut spans = Vec::with_capacity(headings.len());
    let mut seen: Vec<String> = Vec::new();
    for (i, (start, _heading_end, number, title)) in headings.iter().enumerate() {
        let end = headings
            .get(i + 1)
            .map(|(next_start, ..)| *next_start)
            .unwrap_or(text.len());

        // Duplicate numbers happen when a heading is quoted inside a later
        // article; keep the first occurrence, suffix the rest.
        let number = if seen.contains(number) {
            format!("{}-{}", number, i)
        } else {
            number.clone()
        };
        seen.push(number.clone());

        spans.push(ArticleSpan {
            number,
            title: title.clone(),
            text: text[*start..end].to_string(),
            start_offset: *start,
            end_offset: end,
        });
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "CAO Metaal 2026\n\nArtikel 1 Werkingssfeer\nDeze overeenkomst geldt voor alle werknemers.\n\nArtikel 2 Loon\nHet loon wordt maandelijks betaald.\n\nArtikel 3 Overwerk\nOverwerk wordt vergoed tegen 150%.\n";

    #[test]
    fn splits_on_artikel_headings() {
        let spans = segment(SAMPLE);
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].number, "1");
        assert_eq!(spans[1].number, "2");
        assert_eq!(spans[2].number, "3");
        assert_eq!(spans[0].title.as_deref(), Some("Werkingssfeer"));
        assert!(spans[2].text.contains("150%"));
    }

    #[test]
    fn offsets_slice_back_to_source() {
        let spans = segment(SAMPLE);
        for span in &spans {
            assert_eq!(&SAMPLE[span.start_offset..span.end_offset], span.text);
        }
    }

    #[test]
    fn spans_cover_to_end_of_text() {
        let spans = segment(SAMPLE);
        assert_eq!(spans.last().unwrap().end_offset, SAMPLE.len());
    }

    #[test]
    fn single_heading_collapses_to_one_article() {
        let text = "Artikel 1 Alles\nEnige inhoud.";
        let spans = segment(text);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].number, "1");
        assert_eq!(spans[0].text, text);
    }

    #[test]
    fn plain_text_without_headings_is_one_article() {
        let spans = segment("Just a side letter with no articles at all.");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].number, "1");
    }

    #[test]
    fn letter_suffixed_numbers_survive() {
        let text = "Artikel 7 Basis\nInhoud.\n\nArtikel 7a Uitzondering\nMeer inhoud.\n";
        let spans = segment(text);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].number, "7a");
    }

    #[test]
    fn duplicate_numbers_are_disambiguated() {
        let text = "Artikel 4 Eerste\nInhoud.\n\nArtikel 4 Tweede\nAndere inhoud.\n";
        let spans = segment(text);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].number, "4");
        assert_ne!(spans[1].number, "4");
    }
}
