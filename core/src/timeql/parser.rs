use super::ast::{CompareOp, CondValue, Condition, Statement, TimeExpr};
use super::token::{tokenize, Spanned, Token};
use crate::chain::Direction;
use crate::error::EngineError;

/// Default MATCH PATTERN search window when `IN LAST` is absent: 24 hours.
pub(crate) const DEFAULT_PATTERN_WINDOW_MS: i64 = 24 * 3_600_000;

/// Parse one TimeQL statement. Pure and deterministic; all failures carry
/// the offending token and its byte position.
pub fn parse(input: &str) -> Result<Statement, EngineError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        cursor: 0,
        input_len: input.len(),
    };
    let statement = parser.statement()?;
    parser.expect_end()?;
    Ok(statement)
}

struct Parser {
    tokens: Vec<Spanned>,
    cursor: usize,
    input_len: usize,
}

impl Parser {
    fn statement(&mut self) -> Result<Statement, EngineError> {
        let head = self.expect_ident("statement keyword")?;
        match head.to_ascii_uppercase().as_str() {
            "STATE" => self.state_at(),
            "TRAVERSE" => self.traverse(),
            "MATCH" => self.match_pattern(),
            "TIMELINE" => self.timeline(),
            "COMPARE" => self.compare(),
            "PREDICT" => self.predict(),
            _ => Err(self.error_at_previous(
                "expected STATE, TRAVERSE, MATCH, TIMELINE, COMPARE, or PREDICT",
            )),
        }
    }

    // STATE AT '<time>' [WHERE <conds>]
    fn state_at(&mut self) -> Result<Statement, EngineError> {
        self.expect_keyword("AT")?;
        let at = self.time_literal()?;
        let filter = self.optional_where()?;
        Ok(Statement::StateAt { at, filter })
    }

    // TRAVERSE FROM <event_id> FOLLOWING <direction> [UNTIL <conds>]
    fn traverse(&mut self) -> Result<Statement, EngineError> {
        self.expect_keyword("FROM")?;
        let event_id = match self.next("event id")? {
            Spanned {
                token: Token::Ident(id),
                ..
            }
            | Spanned {
                token: Token::Str(id),
                ..
            } => id,
            other => {
                return Err(EngineError::parse(
                    "expected an event id",
                    other.token.to_string(),
                    other.position,
                ))
            }
        };

        self.expect_keyword("FOLLOWING")?;
        let direction_word = self.expect_ident("traversal direction")?;
        let direction = match direction_word.to_ascii_lowercase().as_str() {
            "backward" => Direction::Backward,
            "forward" => Direction::Forward,
            "both" => Direction::Both,
            _ => {
                return Err(self.error_at_previous("expected backward, forward, or both"));
            }
        };

        let until = if self.eat_keyword("UNTIL") {
            self.conditions()?
        } else {
            Vec::new()
        };

        Ok(Statement::Traverse {
            event_id,
            direction,
            until,
        })
    }

    // MATCH PATTERN WHERE <conds> [FOLLOWED BY <conds>] WITHIN <int> <unit>
    //   [IN LAST <int> <unit>]
    fn match_pattern(&mut self) -> Result<Statement, EngineError> {
        self.expect_keyword("PATTERN")?;
        self.expect_keyword("WHERE")?;
        let first = self.conditions()?;

        let followed_by = if self.eat_keyword("FOLLOWED") {
            self.expect_keyword("BY")?;
            Some(self.conditions()?)
        } else {
            None
        };

        self.expect_keyword("WITHIN")?;
        let within_ms = self.duration()?;

        let in_last_ms = if self.eat_keyword("IN") {
            self.expect_keyword("LAST")?;
            Some(self.duration()?)
        } else {
            None
        };

        Ok(Statement::MatchPattern {
            first,
            followed_by,
            within_ms,
            in_last_ms,
        })
    }

    // TIMELINE FROM '<time>' TO '<time>' [WHERE <conds>]
    fn timeline(&mut self) -> Result<Statement, EngineError> {
        self.expect_keyword("FROM")?;
        let start = self.time_literal()?;
        self.expect_keyword("TO")?;
        let end = self.time_literal()?;
        let filter = self.optional_where()?;
        Ok(Statement::Timeline { start, end, filter })
    }

    // COMPARE '<time>' WITH '<time>' [FOR <metric_list>]
    fn compare(&mut self) -> Result<Statement, EngineError> {
        let left = self.time_literal()?;
        self.expect_keyword("WITH")?;
        let right = self.time_literal()?;

        let mut metrics = Vec::new();
        if self.eat_keyword("FOR") {
            loop {
                let metric = match self.next("metric path")? {
                    Spanned {
                        token: Token::Ident(path),
                        ..
                    }
                    | Spanned {
                        token: Token::Str(path),
                        ..
                    } => path,
                    other => {
                        return Err(EngineError::parse(
                            "expected a metric path",
                            other.token.to_string(),
                            other.position,
                        ))
                    }
                };
                metrics.push(metric);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }

        Ok(Statement::Compare {
            left,
            right,
            metrics,
        })
    }

    // PREDICT NEXT <int> <unit> [FROM '<time>']
    fn predict(&mut self) -> Result<Statement, EngineError> {
        self.expect_keyword("NEXT")?;
        let horizon_ms = self.duration()?;
        let from = if self.eat_keyword("FROM") {
            Some(self.time_literal()?)
        } else {
            None
        };
        Ok(Statement::Predict { horizon_ms, from })
    }

    // Conditions ------------------------------------------------------------

    fn optional_where(&mut self) -> Result<Vec<Condition>, EngineError> {
        if self.eat_keyword("WHERE") {
            self.conditions()
        } else {
            Ok(Vec::new())
        }
    }

    fn conditions(&mut self) -> Result<Vec<Condition>, EngineError> {
        let mut conditions = vec![self.condition()?];
        while self.eat_keyword("AND") {
            conditions.push(self.condition()?);
        }
        Ok(conditions)
    }

    fn condition(&mut self) -> Result<Condition, EngineError> {
        let field = self.expect_ident("condition field")?;

        let op = match self.next("comparison operator")? {
            Spanned {
                token: Token::Eq | Token::EqEq,
                ..
            } => CompareOp::Eq,
            Spanned {
                token: Token::Ne, ..
            } => CompareOp::Ne,
            Spanned {
                token: Token::Lt, ..
            } => CompareOp::Lt,
            Spanned {
                token: Token::Le, ..
            } => CompareOp::Le,
            Spanned {
                token: Token::Gt, ..
            } => CompareOp::Gt,
            Spanned {
                token: Token::Ge, ..
            } => CompareOp::Ge,
            other => {
                return Err(EngineError::parse(
                    "expected a comparison operator",
                    other.token.to_string(),
                    other.position,
                ))
            }
        };

        let value = match self.next("condition value")? {
            Spanned {
                token: Token::Str(s),
                ..
            } => CondValue::Str(s),
            Spanned {
                token: Token::Int(n),
                ..
            } => CondValue::Int(n),
            Spanned {
                token: Token::Float(n),
                ..
            } => CondValue::Float(n),
            other => {
                return Err(EngineError::parse(
                    "expected a quoted string or numeric literal",
                    other.token.to_string(),
                    other.position,
                ))
            }
        };

        Ok(Condition { field, op, value })
    }

    // Times and durations ---------------------------------------------------

    fn time_literal(&mut self) -> Result<TimeExpr, EngineError> {
        let spanned = self.next("time literal")?;
        let Token::Str(raw) = &spanned.token else {
            return Err(EngineError::parse(
                "expected a quoted time literal",
                spanned.token.to_string(),
                spanned.position,
            ));
        };
        parse_time(raw, spanned.position)
    }

    fn duration(&mut self) -> Result<i64, EngineError> {
        let amount = match self.next("duration amount")? {
            Spanned {
                token: Token::Int(n),
                position,
            } => {
                if n < 0 {
                    return Err(EngineError::parse(
                        "durations must not be negative",
                        n.to_string(),
                        position,
                    ));
                }
                n
            }
            other => {
                return Err(EngineError::parse(
                    "expected an integer duration",
                    other.token.to_string(),
                    other.position,
                ))
            }
        };

        let unit_word = self.expect_ident("time unit")?;
        let unit_ms = unit_to_ms(&unit_word)
            .ok_or_else(|| self.error_at_previous("expected ms, s, m, h, or d"))?;
        Ok(amount * unit_ms)
    }

    // Token plumbing --------------------------------------------------------

    fn next(&mut self, expected: &str) -> Result<Spanned, EngineError> {
        match self.tokens.get(self.cursor) {
            Some(spanned) => {
                self.cursor += 1;
                Ok(spanned.clone())
            }
            None => Err(EngineError::parse(
                format!("expected {expected}, found end of input"),
                "<eof>",
                self.input_len,
            )),
        }
    }

    fn expect_ident(&mut self, expected: &str) -> Result<String, EngineError> {
        match self.next(expected)? {
            Spanned {
                token: Token::Ident(word),
                ..
            } => Ok(word),
            other => Err(EngineError::parse(
                format!("expected {expected}"),
                other.token.to_string(),
                other.position,
            )),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), EngineError> {
        match self.tokens.get(self.cursor) {
            Some(Spanned {
                token: Token::Ident(word),
                ..
            }) if word.eq_ignore_ascii_case(keyword) => {
                self.cursor += 1;
                Ok(())
            }
            Some(other) => Err(EngineError::parse(
                format!("expected {keyword}"),
                other.token.to_string(),
                other.position,
            )),
            None => Err(EngineError::parse(
                format!("expected {keyword}, found end of input"),
                "<eof>",
                self.input_len,
            )),
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        matches!(
            self.tokens.get(self.cursor),
            Some(Spanned {
                token: Token::Ident(word),
                ..
            }) if word.eq_ignore_ascii_case(keyword)
        ) && {
            self.cursor += 1;
            true
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.tokens.get(self.cursor).map(|s| &s.token) == Some(token) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn expect_end(&mut self) -> Result<(), EngineError> {
        match self.tokens.get(self.cursor) {
            None => Ok(()),
            Some(other) => Err(EngineError::parse(
                "unexpected trailing input",
                other.token.to_string(),
                other.position,
            )),
        }
    }

    fn error_at_previous(&self, message: &str) -> EngineError {
        let spanned = self
            .tokens
            .get(self.cursor.saturating_sub(1))
            .cloned()
            .unwrap_or(Spanned {
                token: Token::Ident("<eof>".to_string()),
                position: self.input_len,
            });
        EngineError::parse(message, spanned.token.to_string(), spanned.position)
    }
}

/// `now`, integer epoch milliseconds, `<n> <unit> ago`, or ISO-8601.
fn parse_time(raw: &str, position: usize) -> Result<TimeExpr, EngineError> {
    let text = raw.trim();

    if text.eq_ignore_ascii_case("now") {
        return Ok(TimeExpr::Now);
    }

    if !text.is_empty()
        && text
            .chars()
            .enumerate()
            .all(|(i, c)| c.is_ascii_digit() || (i == 0 && c == '-'))
    {
        let ms = text
            .parse()
            .map_err(|_| EngineError::parse("malformed epoch timestamp", text, position))?;
        return Ok(TimeExpr::Absolute(ms));
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    if let [amount, unit, ago] = words.as_slice() {
        if ago.eq_ignore_ascii_case("ago") {
            let amount: i64 = amount
                .parse()
                .map_err(|_| EngineError::parse("malformed relative time", text, position))?;
            let unit_ms = unit_to_ms(unit)
                .ok_or_else(|| EngineError::parse("unknown time unit", *unit, position))?;
            return Ok(TimeExpr::Ago(amount * unit_ms));
        }
    }

    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(text) {
        return Ok(TimeExpr::Absolute(parsed.timestamp_millis()));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(TimeExpr::Absolute(naive.and_utc().timestamp_millis()));
    }

    Err(EngineError::parse(
        "expected now, epoch ms, ISO-8601, or `<n> <unit> ago`",
        text,
        position,
    ))
}

fn unit_to_ms(unit: &str) -> Option<i64> {
    match unit.to_ascii_lowercase().as_str() {
        "ms" | "millisecond" | "milliseconds" => Some(1),
        "s" | "second" | "seconds" => Some(1_000),
        "m" | "minute" | "minutes" => Some(60_000),
        "h" | "hour" | "hours" => Some(3_600_000),
        "d" | "day" | "days" => Some(86_400_000),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_at() {
        let stmt = parse("STATE AT '10000'").unwrap();
        assert_eq!(
            stmt,
            Statement::StateAt {
                at: TimeExpr::Absolute(10_000),
                filter: Vec::new(),
            }
        );

        let stmt = parse("state at 'now' where service = 'api' AND data.status >= 500").unwrap();
        let Statement::StateAt { at, filter } = stmt else {
            panic!("wrong statement");
        };
        assert_eq!(at, TimeExpr::Now);
        assert_eq!(filter.len(), 2);
        assert_eq!(filter[0].field, "service");
        assert_eq!(filter[0].op, CompareOp::Eq);
        assert_eq!(filter[1].field, "data.status");
        assert_eq!(filter[1].op, CompareOp::Ge);
        assert_eq!(filter[1].value, CondValue::Int(500));
    }

    #[test]
    fn test_parse_traverse() {
        let stmt = parse("TRAVERSE FROM evt-42 FOLLOWING backward UNTIL eventType = 'error'")
            .unwrap();
        assert_eq!(
            stmt,
            Statement::Traverse {
                event_id: "evt-42".to_string(),
                direction: Direction::Backward,
                until: vec![Condition {
                    field: "eventType".to_string(),
                    op: CompareOp::Eq,
                    value: CondValue::Str("error".to_string()),
                }],
            }
        );

        // Quoted ids work too.
        let stmt = parse("TRAVERSE FROM 'evt 1' FOLLOWING both").unwrap();
        let Statement::Traverse { event_id, direction, until } = stmt else {
            panic!("wrong statement");
        };
        assert_eq!(event_id, "evt 1");
        assert_eq!(direction, Direction::Both);
        assert!(until.is_empty());
    }

    #[test]
    fn test_parse_match_pattern() {
        let stmt = parse(
            "MATCH PATTERN WHERE eventType='error' FOLLOWED BY eventType='error' \
             WITHIN 1 seconds IN LAST 1 minutes",
        )
        .unwrap();
        assert_eq!(
            stmt,
            Statement::MatchPattern {
                first: vec![Condition {
                    field: "eventType".to_string(),
                    op: CompareOp::Eq,
                    value: CondValue::Str("error".to_string()),
                }],
                followed_by: Some(vec![Condition {
                    field: "eventType".to_string(),
                    op: CompareOp::Eq,
                    value: CondValue::Str("error".to_string()),
                }]),
                within_ms: 1_000,
                in_last_ms: Some(60_000),
            }
        );

        let stmt = parse("MATCH PATTERN WHERE serviceId = 'db' WITHIN 500 ms").unwrap();
        let Statement::MatchPattern { followed_by, within_ms, in_last_ms, .. } = stmt else {
            panic!("wrong statement");
        };
        assert!(followed_by.is_none());
        assert_eq!(within_ms, 500);
        assert_eq!(in_last_ms, None);
    }

    #[test]
    fn test_parse_timeline() {
        let stmt =
            parse("TIMELINE FROM '0' TO '5000' WHERE eventType = 'http:request'").unwrap();
        assert_eq!(
            stmt,
            Statement::Timeline {
                start: TimeExpr::Absolute(0),
                end: TimeExpr::Absolute(5_000),
                filter: vec![Condition {
                    field: "eventType".to_string(),
                    op: CompareOp::Eq,
                    value: CondValue::Str("http:request".to_string()),
                }],
            }
        );
    }

    #[test]
    fn test_parse_compare() {
        let stmt = parse("COMPARE '1000' WITH '5 m ago' FOR cpu, memory.used").unwrap();
        assert_eq!(
            stmt,
            Statement::Compare {
                left: TimeExpr::Absolute(1_000),
                right: TimeExpr::Ago(300_000),
                metrics: vec!["cpu".to_string(), "memory.used".to_string()],
            }
        );
    }

    #[test]
    fn test_parse_predict() {
        let stmt = parse("PREDICT NEXT 1 seconds FROM '4500'").unwrap();
        assert_eq!(
            stmt,
            Statement::Predict {
                horizon_ms: 1_000,
                from: Some(TimeExpr::Absolute(4_500)),
            }
        );

        let stmt = parse("PREDICT NEXT 5 m").unwrap();
        assert_eq!(
            stmt,
            Statement::Predict {
                horizon_ms: 300_000,
                from: None,
            }
        );
    }

    #[test]
    fn test_parse_iso_8601() {
        let stmt = parse("STATE AT '1970-01-01T00:00:10Z'").unwrap();
        assert_eq!(
            stmt,
            Statement::StateAt {
                at: TimeExpr::Absolute(10_000),
                filter: Vec::new(),
            }
        );
    }

    #[test]
    fn test_parse_errors_carry_token_and_position() {
        let err = parse("STATE AT now").unwrap_err();
        let EngineError::Parse { token, position, .. } = err else {
            panic!("expected parse error");
        };
        assert_eq!(token, "now");
        assert_eq!(position, 9);

        assert!(matches!(
            parse("TRAVERSE FROM x FOLLOWING sideways"),
            Err(EngineError::Parse { .. })
        ));
        assert!(matches!(
            parse("MATCH PATTERN WHERE a = 'b' WITHIN 1 fortnight"),
            Err(EngineError::Parse { .. })
        ));
        assert!(matches!(parse(""), Err(EngineError::Parse { .. })));
        assert!(matches!(
            parse("STATE AT '0' garbage"),
            Err(EngineError::Parse { .. })
        ));
    }

    #[test]
    fn test_parsing_is_deterministic() {
        let a = parse("TIMELINE FROM '0' TO '100' WHERE x = 1").unwrap();
        let b = parse("TIMELINE FROM '0' TO '100' WHERE x = 1").unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
