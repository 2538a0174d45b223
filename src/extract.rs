//! Distinct Han characters in first-occurrence order.

use std::collections::HashSet;

use crate::util::is_cjk;

/// Union over one or more text fragments (prompt, options), ordered by
/// first occurrence.
pub fn extract_chars_from<'a>(texts: impl IntoIterator<Item = &'a str>) -> Vec<char> {
  let mut seen = HashSet::new();
  let mut out = Vec::new();
  for text in texts {
    for ch in text.chars().filter(|c| is_cjk(*c)) {
      if seen.insert(ch) {
        out.push(ch);
      }
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn riddle_prompt_drops_punctuation() {
    assert_eq!(
      extract_chars_from(["什么东西早晨四条腿？"]),
      vec!['什', '么', '东', '西', '早', '晨', '四', '条', '腿']
    );
  }

  #[test]
  fn duplicates_keep_first_position() {
    assert_eq!(extract_chars_from(["天天向上，天"]), vec!['天', '向', '上']);
  }

  #[test]
  fn empty_and_non_han_inputs() {
    assert!(extract_chars_from([""]).is_empty());
    assert!(extract_chars_from(["ABC 123 !?"]).is_empty());
  }

  #[test]
  fn union_across_fragments() {
    let chars = extract_chars_from(["大人", "人口", "A"]);
    assert_eq!(chars, vec!['大', '人', '口']);
  }
}
