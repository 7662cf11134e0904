use crate::forms::{Question, ResponseType};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

pub const REQUIRED_COLUMNS: [&str; 3] = ["QuestionType", "QuestionText", "Required"];
pub const MAX_OPTIONS: usize = 8;

const SAMPLE_TEMPLATE: &str = "QuestionType,QuestionText,Required,Option1,Option2,Option3,Option4,Option5,Option6,Option7,Option8
Multiple Choice,What technique was used for this skill?,true,Technique A,Technique B,Technique C,Technique D,,,,
Multiple Choice,Rate the student's performance,true,Excellent,Good,Satisfactory,Needs Improvement,,,,
Multiple Choice,What level of supervision was required?,true,None,Minimal,Moderate,Significant,Constant,,,
Select Multiple,Which safety protocols were followed?,true,Hand hygiene,PPE usage,Sterile technique,Equipment check,Patient identification,Documentation,Area preparation,Time out
Checkbox,Was the procedure completed successfully?,true,,,,,,,,
Text,Describe the steps taken to complete this skill,true,,,,,,,,
Number,How many attempts were needed?,true,,,,,,,,
Text,Provide feedback for improvement,false,,,,,,,,
";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ImportError {
    #[error("The file contains no data")]
    NoData,
    #[error("Missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("Unterminated quoted field starting on line {0}")]
    UnterminatedQuote(usize),
}

pub fn sample_template() -> &'static str {
    SAMPLE_TEMPLATE
}

/// Splits CSV text into records. Quoted fields may contain commas, doubled
/// quotes and line breaks; a quote left open at end of input is an error.
pub fn parse_csv(text: &str) -> Result<Vec<Vec<String>>, ImportError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut records: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut line = 1usize;
    let mut quote_line = 0usize;
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            if in_quotes {
                quote_line = line;
            }
            i += 1;
            continue;
        }
        if !in_quotes && ch == ',' {
            record.push(std::mem::take(&mut buf));
            i += 1;
            continue;
        }
        if !in_quotes && (ch == '\n' || ch == '\r') {
            if ch == '\r' && i + 1 < chars.len() && chars[i + 1] == '\n' {
                i += 1;
            }
            record.push(std::mem::take(&mut buf));
            records.push(std::mem::take(&mut record));
            line += 1;
            i += 1;
            continue;
        }
        if ch == '\n' {
            line += 1;
        }
        buf.push(ch);
        i += 1;
    }
    if in_quotes {
        return Err(ImportError::UnterminatedQuote(quote_line));
    }
    if !buf.is_empty() || !record.is_empty() {
        record.push(buf);
        records.push(record);
    }
    Ok(records
        .into_iter()
        .filter(|r| r.iter().any(|f| !f.trim().is_empty()))
        .collect())
}

/// Free-text type names map onto the internal enum by substring, first match wins.
pub fn map_question_type(raw: &str) -> ResponseType {
    let t = raw.trim().to_lowercase();
    if t.contains("multiple choice") || t.contains("mc") {
        ResponseType::MultipleChoice
    } else if t.contains("select multiple") || t.contains("select all") {
        ResponseType::SelectMultiple
    } else if t.contains("checkbox") || t.contains("yes/no") {
        ResponseType::Checkbox
    } else if t.contains("number") {
        ResponseType::Number
    } else {
        ResponseType::Text
    }
}

/// Unrecognised values fall back to required.
pub fn parse_required(raw: &str) -> bool {
    match raw.trim().to_lowercase().as_str() {
        "false" | "0" | "no" => false,
        _ => true,
    }
}

struct Columns {
    by_name: HashMap<String, usize>,
}

impl Columns {
    fn new(header: &[String]) -> Self {
        let by_name = header
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim().to_lowercase(), i))
            .collect();
        Self { by_name }
    }

    fn has(&self, name: &str) -> bool {
        self.by_name.contains_key(&name.to_lowercase())
    }

    fn get<'a>(&self, row: &'a [String], name: &str) -> &'a str {
        self.by_name
            .get(&name.to_lowercase())
            .and_then(|&i| row.get(i))
            .map(|s| s.as_str())
            .unwrap_or("")
    }
}

pub fn import_questions(text: &str) -> Result<Vec<Question>, ImportError> {
    let mut records = parse_csv(text)?.into_iter();
    let Some(header) = records.next() else {
        return Err(ImportError::NoData);
    };
    let rows: Vec<Vec<String>> = records.collect();
    if rows.is_empty() {
        return Err(ImportError::NoData);
    }

    let cols = Columns::new(&header);
    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|c| !cols.has(c))
        .map(|c| c.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ImportError::MissingColumns(missing));
    }

    let questions = rows
        .iter()
        .enumerate()
        .map(|(index, row)| {
            let response_type = map_question_type(cols.get(row, "QuestionType"));
            let options = if response_type.is_choice() {
                let opts: Vec<String> = (1..=MAX_OPTIONS)
                    .map(|n| cols.get(row, &format!("Option{}", n)).trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect();
                if opts.is_empty() {
                    None
                } else {
                    Some(opts)
                }
            } else {
                None
            };
            let text = cols.get(row, "QuestionText").trim();
            Question {
                id: Uuid::new_v4().to_string(),
                question_text: if text.is_empty() {
                    format!("Question {}", index + 1)
                } else {
                    text.to_string()
                },
                response_type,
                is_required: parse_required(cols.get(row, "Required")),
                order_index: index as i64,
                options,
            }
        })
        .collect();
    Ok(questions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_choice_row_keeps_its_options() {
        let csv = "QuestionType,QuestionText,Required,Option1,Option2,Option3,Option4\n\
                   Multiple Choice,Pick one,true,Red,Green,Blue,\n";
        let qs = import_questions(csv).expect("import");
        assert_eq!(qs.len(), 1);
        assert_eq!(qs[0].response_type, ResponseType::MultipleChoice);
        assert_eq!(
            qs[0].options,
            Some(vec!["Red".to_string(), "Green".to_string(), "Blue".to_string()])
        );
        assert_eq!(qs[0].order_index, 0);
    }

    #[test]
    fn missing_columns_are_named() {
        let csv = "QuestionText,Option1\nSomething,A\n";
        let err = import_questions(csv).expect_err("missing columns");
        assert_eq!(
            err,
            ImportError::MissingColumns(vec!["QuestionType".to_string(), "Required".to_string()])
        );
        assert_eq!(
            err.to_string(),
            "Missing required columns: QuestionType, Required"
        );
    }

    #[test]
    fn header_only_file_has_no_data() {
        assert_eq!(
            import_questions("QuestionType,QuestionText,Required\n"),
            Err(ImportError::NoData)
        );
        assert_eq!(import_questions(""), Err(ImportError::NoData));
    }

    #[test]
    fn type_names_map_by_substring() {
        assert_eq!(map_question_type("Select All"), ResponseType::SelectMultiple);
        assert_eq!(map_question_type("select multiple"), ResponseType::SelectMultiple);
        assert_eq!(map_question_type("Yes/No"), ResponseType::Checkbox);
        assert_eq!(map_question_type("Number"), ResponseType::Number);
        assert_eq!(map_question_type("Short Answer"), ResponseType::Text);
        assert_eq!(map_question_type(""), ResponseType::Text);
    }

    #[test]
    fn required_defaults_to_true() {
        assert!(parse_required("TRUE"));
        assert!(parse_required("1"));
        assert!(parse_required("maybe"));
        assert!(parse_required(""));
        assert!(!parse_required("false"));
        assert!(!parse_required("0"));
        assert!(!parse_required(" No "));
        assert!(parse_required("n"));
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        let csv = "QuestionType,QuestionText,Required\n\
                   text,\"Fine\",true\n\
                   text,\"Runs on,true\n\
                   checkbox,Never seen,false\n";
        assert_eq!(import_questions(csv), Err(ImportError::UnterminatedQuote(3)));
        assert_eq!(
            ImportError::UnterminatedQuote(3).to_string(),
            "Unterminated quoted field starting on line 3"
        );
    }

    #[test]
    fn quoted_fields_and_case_insensitive_headers() {
        let csv = "questiontype,QUESTIONTEXT,required\r\n\
                   text,\"Describe, in detail, the \"\"setup\"\"\",false\r\n\
                   \r\n\
                   checkbox,,true\r\n";
        let qs = import_questions(csv).expect("import");
        assert_eq!(qs.len(), 2);
        assert_eq!(qs[0].question_text, "Describe, in detail, the \"setup\"");
        assert!(!qs[0].is_required);
        assert_eq!(qs[1].question_text, "Question 2");
        assert_eq!(qs[1].response_type, ResponseType::Checkbox);
        assert_eq!(qs[1].options, None);
    }

    #[test]
    fn sample_template_imports_cleanly() {
        let qs = import_questions(sample_template()).expect("template");
        assert_eq!(qs.len(), 8);
        assert_eq!(qs[3].options.as_ref().map(|o| o.len()), Some(MAX_OPTIONS));
        let schema = crate::forms::FormSchema { questions: qs };
        assert!(schema.validate().is_ok());
    }
}
