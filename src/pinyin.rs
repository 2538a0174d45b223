//! Offline Hanyu Pinyin table, used to sanity-check readings coming back
//! from the disambiguation service.
//!
//! Example:
//!   '长' → ["cháng", "zhǎng"]
use pinyin::ToPinyinMulti;

/// Every reading (tone diacritics) the offline table knows for `ch`.
/// Empty for characters outside the table.
pub fn known_readings(ch: char) -> Vec<&'static str> {
  match ch.to_pinyin_multi() {
    Some(multi) => multi.into_iter().map(|p| p.with_tone()).collect(),
    None => Vec::new(),
  }
}

fn normalize(reading: &str) -> String {
  reading.trim().to_lowercase().replace(' ', "")
}

/// False only when the table knows the character and none of its
/// readings match. Unknown characters get the benefit of the doubt.
pub fn is_plausible_reading(ch: char, reading: &str) -> bool {
  let known = known_readings(ch);
  if known.is_empty() {
    return true;
  }
  let wanted = normalize(reading);
  known.iter().any(|k| normalize(k) == wanted)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn heteronyms_are_listed() {
    let r = known_readings('长');
    assert!(r.contains(&"cháng"));
    assert!(r.contains(&"zhǎng"));
  }

  #[test]
  fn plausibility() {
    assert!(is_plausible_reading('长', "zhǎng"));
    assert!(is_plausible_reading('长', " Cháng "));
    assert!(!is_plausible_reading('长', "dà"));
    assert!(is_plausible_reading('A', "anything"));
  }
}
