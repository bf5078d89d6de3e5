use regex::Regex;
use std::sync::OnceLock;
use xtalscreen_core::{IndexingSolution, Result, XtalscreenError};

fn solution_regex() -> &'static Regex {
    static SOLUTION_RE: OnceLock<Regex> = OnceLock::new();
    // Safety: this regex literal is guaranteed to compile
    SOLUTION_RE.get_or_init(|| {
        Regex::new(
            r"model [0-9]+ \(([0-9]+) [^\n]*\n[^\n]*\n[^\n]*Unit cell: \(([^\n]*)\)\n[^\n]*Space group: ([^\n]*)\n",
        )
        .unwrap()
    })
}

fn bravais_table_regex() -> &'static Regex {
    static TABLE_RE: OnceLock<Regex> = OnceLock::new();
    // Safety: this regex literal is guaranteed to compile
    TABLE_RE.get_or_init(|| Regex::new(r"---+\n[^\n]*\n---+\n(.*\n)*---+").unwrap())
}

/// Extract the primitive solution from indexer output
pub fn parse_indexing_solution(stdout: &str) -> Option<IndexingSolution> {
    let captures = solution_regex().captures(stdout)?;
    Some(IndexingSolution {
        reflections: captures[1].parse().ok()?,
        unit_cell: captures[2].to_string(),
        space_group: captures[3].trim().to_string(),
    })
}

/// Extract the table of candidate lattices from Bravais refinement output
pub fn extract_bravais_table(stdout: &str) -> Option<&str> {
    bravais_table_regex().find(stdout).map(|m| m.as_str())
}

pub fn parse_processor_count(stdout: &str) -> Result<usize> {
    let text = stdout.trim();
    match text.parse::<usize>() {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(XtalscreenError::Parse(format!(
            "unexpected processor count '{}'",
            text
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX_OUTPUT: &str = "\
Starting refinement (macro-cycle 1)
RMSDs by experiment:
Final refined crystal models:
model 1 (1544 reflections):
Crystal:
    Unit cell: (7.851, 7.862, 14.023, 90.011, 89.985, 119.982)
    Space group: P 1
    U matrix:  {{ 0.1234, -0.5678,  0.9012},
";

    const BRAVAIS_OUTPUT: &str = "\
Chiral space groups corresponding to each Bravais lattice:
---------------------------------------------------
Solution Metric fit  rmsd  min/max cc  #spots  lattice
---------------------------------------------------
*    2      0.0297 0.007 0.912/0.912    1000      hP
*    1      0.0000 0.006     -/-        1000      aP
---------------------------------------------------
* = recommended solution
";

    #[test]
    fn test_parse_indexing_solution() {
        let solution = parse_indexing_solution(INDEX_OUTPUT).unwrap();
        assert_eq!(solution.reflections, 1544);
        assert_eq!(
            solution.unit_cell,
            "7.851, 7.862, 14.023, 90.011, 89.985, 119.982"
        );
        assert_eq!(solution.space_group, "P 1");
    }

    #[test]
    fn test_indexing_solution_missing() {
        assert_eq!(parse_indexing_solution("no solution found\n"), None);
    }

    #[test]
    fn test_extract_bravais_table() {
        let table = extract_bravais_table(BRAVAIS_OUTPUT).unwrap();
        assert!(table.starts_with("-----"));
        assert!(table.ends_with("-----"));
        assert!(table.contains("hP"));
        assert!(table.contains("aP"));
        assert!(!table.contains("recommended"));
    }

    #[test]
    fn test_bravais_table_missing() {
        assert_eq!(extract_bravais_table("nothing here"), None);
    }

    #[test]
    fn test_parse_processor_count() {
        assert_eq!(parse_processor_count("16\n").unwrap(), 16);
        assert!(parse_processor_count("").is_err());
        assert!(parse_processor_count("0").is_err());
        assert!(parse_processor_count("many").is_err());
    }
}
