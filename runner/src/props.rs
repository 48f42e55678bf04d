/*
 * Copyright 2024 Oxide Computer Company
 */

use std::collections::BTreeMap;

/**
 * Does this line end in a backslash that is not itself escaped?
 */
fn continues(line: &str) -> bool {
    line.chars().rev().take_while(|c| *c == '\\').count() % 2 == 1
}

/**
 * Parse the line-oriented "key=value" properties format that jobs use to
 * report metrics.  Lines beginning with "#" or "!" are comments; a key is
 * separated from its value by "=", ":", or whitespace; and a line ending in a
 * backslash is joined with the line that follows.
 */
pub fn parse(input: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut lines = input.lines();

    while let Some(line) = lines.next() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }

        let mut logical = line.to_string();
        while continues(&logical) {
            logical.pop();
            match lines.next() {
                Some(next) => logical.push_str(next.trim_start()),
                None => break,
            }
        }

        let (k, v) = match logical
            .find(|c: char| c == '=' || c == ':' || c.is_whitespace())
        {
            Some(i) => {
                let rest = logical[i..].trim_start();
                let rest = rest
                    .strip_prefix('=')
                    .or_else(|| rest.strip_prefix(':'))
                    .unwrap_or(rest);
                (&logical[..i], rest)
            }
            None => (logical.as_str(), ""),
        };

        let k = k.trim();
        if k.is_empty() {
            continue;
        }
        out.insert(k.to_string(), v.trim().to_string());
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn basic() {
        let p = parse(
            "# metrics\n\
            ! also a comment\n\
            \n\
            Count=10\n\
            __InputCount__ : 12\n\
            ExecutionTime   3.5\n\
            Flag\n\
            When 12:30\n",
        );

        assert_eq!(p.len(), 5);
        assert_eq!(p["Count"], "10");
        assert_eq!(p["__InputCount__"], "12");
        assert_eq!(p["ExecutionTime"], "3.5");
        assert_eq!(p["Flag"], "");
        assert_eq!(p["When"], "12:30");
    }

    #[test]
    fn continuation() {
        let p = parse("names = alpha, \\\n    beta, \\\n    gamma\nnext=1\n");

        assert_eq!(p["names"], "alpha, beta, gamma");
        assert_eq!(p["next"], "1");
    }

    #[test]
    fn escaped_backslash_does_not_continue() {
        let p = parse("path=C:\\\\\nother=2\n");

        assert_eq!(p["path"], "C:\\\\");
        assert_eq!(p["other"], "2");
    }

    #[test]
    fn first_separator_wins() {
        let p = parse("url=http://example.com:8080/\n");
        assert_eq!(p["url"], "http://example.com:8080/");
    }
}
