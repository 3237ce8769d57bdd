//! In-place regex patching of SGF game records written by the engine.
//!
//! Grounded on `autogtp/Game.cpp`'s `fixSgfPlayer`/`fixSgfComment`/
//! `fixSgfResult`/`fixSgf` and `gameStart`'s handicap-sniffing regex. The
//! engine is trusted to produce a syntactically valid SGF; these patches
//! only ever touch specific header tags via regex, matching the source's own
//! approach rather than parsing SGF as a structured format.

use regex::Regex;

/// `true` if the SGF text declares a handicap (`HA[n]` with `n > 0`).
pub fn is_handicap(sgf: &str) -> bool {
    static HA: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = HA.get_or_init(|| Regex::new(r"HA\[(\d+)\]").unwrap());
    re.captures(sgf)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .is_some_and(|n| n > 0)
}

/// Replaces the `PW[Human]` placeholder the engine writes for the second
/// player with an identifying tag for the white engine.
pub fn fix_player(sgf: &str, white_version: &str, white_hash: &str) -> String {
    static PW: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = PW.get_or_init(|| Regex::new(r"PW\[Human\]").unwrap());
    let short_hash: String = white_hash.chars().take(8).collect();
    let replacement = format!("PW[Leela Zero {white_version} {short_hash}]");
    re.replace(sgf, replacement.as_str()).into_owned()
}

/// Rewrites the `C[Leela Zero …]` root comment to record both sides'
/// options and starting commands. For self-play, `black` and `white` are
/// the same options string and no colour prefix is added; for a match,
/// each side is prefixed `Black`/`White`.
pub fn fix_comment(sgf: &str, black_info: &str, white_info: &str, is_match: bool) -> String {
    static COMMENT: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = COMMENT.get_or_init(|| Regex::new(r"C\[Leela Zero[^\]]*\]").unwrap());
    let replacement = if is_match {
        format!("C[Black: {black_info} White: {white_info}]")
    } else {
        format!("C[Leela Zero {black_info}]")
    };
    re.replace(sgf, regex::NoExpand(&replacement)).into_owned()
}

/// On black resignation, rewrites the result tag to `RE[B+Resign]` and
/// strips a trailing white pass move (`;W[tt]` immediately before the
/// closing `)`), which the engine writes to flush its own end-of-game state
/// but which is not part of the recorded game.
pub fn fix_result(sgf: &str, black_resigned: bool) -> String {
    if !black_resigned {
        return sgf.to_string();
    }
    static RESULT: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RESULT.get_or_init(|| Regex::new(r"RE\[[BW]\+[^\]]*\]").unwrap());
    let patched = re.replace(sgf, "RE[B+Resign]").into_owned();

    static TRAILING_PASS: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let pass_re = TRAILING_PASS.get_or_init(|| Regex::new(r";W\[tt\]\)\s*$").unwrap());
    pass_re.replace(&patched, ")").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_handicap() {
        assert!(is_handicap("(;GM[1]FF[4]HA[4]RE[B+12.5])"));
        assert!(!is_handicap("(;GM[1]FF[4]HA[0]RE[B+12.5])"));
        assert!(!is_handicap("(;GM[1]FF[4]RE[B+12.5])"));
    }

    #[test]
    fn patches_player_tag() {
        let sgf = "(;PW[Human]PB[Leela Zero])";
        let patched = fix_player(sgf, "0.17", "deadbeef12345678");
        assert_eq!(patched, "(;PW[Leela Zero 0.17 deadbeef]PB[Leela Zero])");
    }

    #[test]
    fn resignation_rewrites_result_and_strips_trailing_pass() {
        let sgf = "(;RE[W+12.5];B[dd];W[tt])";
        let patched = fix_result(sgf, true);
        assert_eq!(patched, "(;RE[B+Resign];B[dd])");
    }

    #[test]
    fn non_resignation_leaves_sgf_untouched() {
        let sgf = "(;RE[W+12.5];B[dd];W[tt])";
        assert_eq!(fix_result(sgf, false), sgf);
    }
}
