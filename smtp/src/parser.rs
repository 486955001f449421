use super::*;
use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_till1, take_while, take_while1},
    character::complete::{char, space0, space1},
    combinator::{eof, map, opt, rest, verify},
    sequence::{delimited, preceded, terminated},
    IResult, Parser,
};

/// Represents valid SMTP commands that can be received from a client
#[derive(Debug, PartialEq)]
pub enum SmtpCommand {
    /// EHLO command with domain parameter
    Ehlo(String),
    /// HELO command with domain parameter
    Helo(String),
    /// AUTH command with the mechanism name and an optional initial response
    Auth {
        mechanism: String,
        initial_response: Option<String>,
    },
    /// Continuation line sent while an AUTH exchange is in progress
    AuthResponse(String),
    /// MAIL FROM command with the reverse-path address
    MailFrom(String),
    /// RCPT TO command with the forward-path address
    RcptTo(String),
    /// DATA command
    Data,
    /// QUIT command
    Quit,
    /// RSET command
    Rset,
    /// NOOP command
    Noop,
}

/// Parses a raw input line into an SMTP command based on the current session state
pub fn parse_command(input: &str, state: &SessionState) -> Result<SmtpCommand, SmtpError> {
    let input = input.trim_end_matches(['\r', '\n']);
    let parse_result: IResult<&str, SmtpCommand> = match state {
        SessionState::AuthenticatingPlain => parse_auth_response(input),
        _ => parse_normal_command(input),
    };

    parse_result
        .map(|(_, cmd)| cmd)
        .map_err(|e| SmtpError::ParseError {
            message: e.to_string(),
            span: (0, input.len()).into(),
        })
}

fn parse_auth_response(input: &str) -> IResult<&str, SmtpCommand> {
    let response = |s: &str| SmtpCommand::AuthResponse(s.trim().to_string());
    map(rest, response).parse(input)
}

fn parse_normal_command(input: &str) -> IResult<&str, SmtpCommand> {
    alt((
        parse_ehlo,
        parse_helo,
        parse_auth,
        parse_mail_from,
        parse_rcpt_to,
        parse_simple_command,
    ))
    .parse(input)
}

fn parse_domain(input: &str) -> IResult<&str, &str> {
    let domain = take_till1(|c: char| c.is_whitespace());
    terminated(verify(domain, |s: &str| s.len() <= 255), line_end).parse(input)
}

fn parse_ehlo(input: &str) -> IResult<&str, SmtpCommand> {
    map(
        preceded((tag_no_case("EHLO"), space1), parse_domain),
        |domain: &str| SmtpCommand::Ehlo(domain.to_string()),
    )
    .parse(input)
}

fn parse_helo(input: &str) -> IResult<&str, SmtpCommand> {
    map(
        preceded((tag_no_case("HELO"), space1), parse_domain),
        |domain: &str| SmtpCommand::Helo(domain.to_string()),
    )
    .parse(input)
}

fn parse_auth(input: &str) -> IResult<&str, SmtpCommand> {
    map(
        terminated(
            preceded(
                (tag_no_case("AUTH"), space1),
                (
                    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
                    opt(preceded(space1, take_till1(|c: char| c.is_whitespace()))),
                ),
            ),
            line_end,
        ),
        |(mechanism, initial): (&str, Option<&str>)| SmtpCommand::Auth {
            mechanism: mechanism.to_ascii_uppercase(),
            initial_response: initial.map(str::to_string),
        },
    )
    .parse(input)
}

/// Parses a reverse or forward path, with or without angle brackets. `<>` is the null path.
fn parse_path(input: &str) -> IResult<&str, &str> {
    preceded(
        space0,
        alt((
            delimited(char('<'), take_while(|c: char| c != '>'), char('>')),
            take_till1(|c: char| c.is_whitespace()),
        )),
    )
    .parse(input)
}

fn parse_mail_from(input: &str) -> IResult<&str, SmtpCommand> {
    // ESMTP parameters after the path (SIZE=, BODY=) are accepted and ignored.
    map(
        terminated(preceded(tag_no_case("MAIL FROM:"), parse_path), rest),
        |address: &str| SmtpCommand::MailFrom(address.trim().to_string()),
    )
    .parse(input)
}

fn parse_rcpt_to(input: &str) -> IResult<&str, SmtpCommand> {
    map(
        terminated(preceded(tag_no_case("RCPT TO:"), parse_path), rest),
        |address: &str| SmtpCommand::RcptTo(address.trim().to_string()),
    )
    .parse(input)
}

fn line_end(input: &str) -> IResult<&str, (&str, &str)> {
    (space0, eof).parse(input)
}

fn parse_simple_command(input: &str) -> IResult<&str, SmtpCommand> {
    alt((
        map(
            terminated(tag_no_case("DATA"), line_end),
            |_| SmtpCommand::Data,
        ),
        map(
            terminated(tag_no_case("QUIT"), line_end),
            |_| SmtpCommand::Quit,
        ),
        map(
            terminated(tag_no_case("RSET"), line_end),
            |_| SmtpCommand::Rset,
        ),
        map(
            preceded(tag_no_case("NOOP"), alt((eof, preceded(space1, rest)))),
            |_| SmtpCommand::Noop,
        ),
    ))
    .parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ehlo() {
        assert_eq!(
            parse_command("EHLO example.com", &SessionState::Connected).unwrap(),
            SmtpCommand::Ehlo("example.com".to_string())
        );
        assert_eq!(
            parse_command("ehlo example.com\r\n", &SessionState::Connected).unwrap(),
            SmtpCommand::Ehlo("example.com".to_string())
        );
        assert_eq!(
            parse_command("HELO mail.example.com", &SessionState::Connected).unwrap(),
            SmtpCommand::Helo("mail.example.com".to_string())
        );

        // Address literals are sent by some clients in place of a hostname
        assert_eq!(
            parse_command("EHLO [127.0.0.1]", &SessionState::Connected).unwrap(),
            SmtpCommand::Ehlo("[127.0.0.1]".to_string())
        );
    }

    #[test]
    fn test_auth_commands() {
        assert_eq!(
            parse_command("AUTH PLAIN dGVzdAB0ZXN0", &SessionState::Greeted).unwrap(),
            SmtpCommand::Auth {
                mechanism: "PLAIN".to_string(),
                initial_response: Some("dGVzdAB0ZXN0".to_string()),
            }
        );
        assert_eq!(
            parse_command("auth plain", &SessionState::Greeted).unwrap(),
            SmtpCommand::Auth {
                mechanism: "PLAIN".to_string(),
                initial_response: None,
            }
        );
        assert_eq!(
            parse_command("AUTH LOGIN", &SessionState::Greeted).unwrap(),
            SmtpCommand::Auth {
                mechanism: "LOGIN".to_string(),
                initial_response: None,
            }
        );

        // Everything is a continuation while the exchange is open
        assert_eq!(
            parse_command("AHVzZXIAcGFzcw==\r\n", &SessionState::AuthenticatingPlain).unwrap(),
            SmtpCommand::AuthResponse("AHVzZXIAcGFzcw==".to_string())
        );
        assert_eq!(
            parse_command("QUIT", &SessionState::AuthenticatingPlain).unwrap(),
            SmtpCommand::AuthResponse("QUIT".to_string())
        );
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(
            parse_command("DATA", &SessionState::ReceivingRcptTo).unwrap(),
            SmtpCommand::Data
        );
        assert_eq!(
            parse_command("QUIT\r\n", &SessionState::Connected).unwrap(),
            SmtpCommand::Quit
        );
        assert_eq!(
            parse_command("rset", &SessionState::Connected).unwrap(),
            SmtpCommand::Rset
        );
        assert_eq!(
            parse_command("NoOp", &SessionState::Connected).unwrap(),
            SmtpCommand::Noop
        );
        assert_eq!(
            parse_command("NOOP keepalive", &SessionState::Connected).unwrap(),
            SmtpCommand::Noop
        );
    }

    #[test]
    fn test_invalid_commands() {
        assert!(parse_command("INVALID", &SessionState::Connected).is_err());
        assert!(parse_command("", &SessionState::Connected).is_err());
        assert!(parse_command("MAIL FROM", &SessionState::Greeted).is_err());
        assert!(parse_command("MAIL FROM:", &SessionState::Greeted).is_err());
        assert!(parse_command("RCPT TO", &SessionState::Greeted).is_err());
        assert!(parse_command("AUTH", &SessionState::Greeted).is_err());
        assert!(parse_command("DATAX", &SessionState::Greeted).is_err());
        assert!(parse_command("EHLO", &SessionState::Connected).is_err());
    }

    #[test]
    fn test_mail_rcpt_commands() {
        let state = SessionState::Greeted;

        assert_eq!(
            parse_command("MAIL FROM:<user@example.com>", &state).unwrap(),
            SmtpCommand::MailFrom("user@example.com".to_string())
        );
        assert_eq!(
            parse_command("mail from: <admin@test.com>  ", &state).unwrap(),
            SmtpCommand::MailFrom("admin@test.com".to_string())
        );
        assert_eq!(
            parse_command("MAIL FROM:<user@example.com> SIZE=1024 BODY=8BITMIME", &state).unwrap(),
            SmtpCommand::MailFrom("user@example.com".to_string())
        );
        assert_eq!(
            parse_command("MAIL FROM:user@example.com", &state).unwrap(),
            SmtpCommand::MailFrom("user@example.com".to_string())
        );

        // Null reverse-path
        assert_eq!(
            parse_command("MAIL FROM:<>", &state).unwrap(),
            SmtpCommand::MailFrom("".to_string())
        );

        assert_eq!(
            parse_command("RCPT TO:<recipient@domain.com>\r\n", &state).unwrap(),
            SmtpCommand::RcptTo("recipient@domain.com".to_string())
        );
        assert_eq!(
            parse_command("rcpt to:<charming.alpaca.noos@letterguard.net>", &state).unwrap(),
            SmtpCommand::RcptTo("charming.alpaca.noos@letterguard.net".to_string())
        );
    }

    #[test]
    fn test_command_boundaries() {
        let long_domain = "a".repeat(255);
        assert!(parse_command(&format!("EHLO {}", long_domain), &SessionState::Connected).is_ok());

        let too_long_domain = "a".repeat(256);
        assert!(parse_command(
            &format!("EHLO {}", too_long_domain),
            &SessionState::Connected
        )
        .is_err());
    }
}
