// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Locate the PEM-encoded certificate signing request a device prints during provisioning.

use crate::error::CsrError;

/// The first line of a PEM-encoded CSR.
pub const BEGIN: &str = "-----BEGIN CERTIFICATE REQUEST-----";
/// The last line of a PEM-encoded CSR.
pub const END: &str = "-----END CERTIFICATE REQUEST-----";

/// Find the first well-formed CSR block in `text`.
///
/// A block starts with a line beginning with [`BEGIN`] and ends with a line beginning with
/// [`END`]. Every line between them must be non-empty base64; a trailing carriage return is
/// allowed since the device terminates lines with `\r\n`. Candidates that don't meet those
/// rules are skipped, so log text that happens to contain the header cannot be mistaken for
/// the request.
///
/// The returned slice runs from the start of the header to the end of the footer and is
/// otherwise verbatim, line endings included.
///
/// # Errors
///
/// [`CsrError::NotFound`] is returned if there is no well-formed block.
pub fn extract(text: &str) -> Result<&str, CsrError> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find(BEGIN) {
        let start = search_from + offset;
        search_from = start + BEGIN.len();

        let at_line_start = start == 0 || text[..start].ends_with('\n');
        if !at_line_start {
            continue;
        }
        if let Some(end) = block_end(text, search_from) {
            return Ok(&text[start..end]);
        }
    }

    Err(CsrError::NotFound)
}

// Returns the offset just past the footer if the block starting at `header_end` is well-formed.
fn block_end(text: &str, header_end: usize) -> Option<usize> {
    let rest = &text[header_end..];
    let newline = rest.find('\n')?;
    if !rest[..newline].trim_end_matches('\r').is_empty() {
        return None;
    }

    let mut position = header_end + newline + 1;
    let mut body_lines = 0;
    loop {
        let rest = &text[position..];
        if rest.starts_with(END) {
            return (body_lines > 0).then_some(position + END.len());
        }

        let newline = rest.find('\n')?;
        let line = rest[..newline].trim_end_matches('\r');
        if line.is_empty() || !line.bytes().all(is_base64) {
            return None;
        }
        body_lines += 1;
        position += newline + 1;
    }
}

fn is_base64(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'/' | b'=')
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSR: &str = "-----BEGIN CERTIFICATE REQUEST-----\n\
        MIHzMIGaAgEAMDgxNjA0BgNVBAMMLUZyZWVSVE9TX1AxMV9LZXkgZXhhbXBsZSBk\n\
        ZXZpY2UgY2VydGlmaWNhdGUwWTATBgcqhkjOPQIBBggqhkjOPQMBBwNCAAQ=\n\
        -----END CERTIFICATE REQUEST-----";

    #[test]
    fn extract_single_block() -> anyhow::Result<()> {
        let output = format!("Creating CSR\nOutputting CSR:\n{CSR}\nFinished outputting CSR.\n");

        assert_eq!(extract(&output)?, CSR);
        Ok(())
    }

    #[test]
    fn extract_keeps_carriage_returns() -> anyhow::Result<()> {
        let crlf = CSR.replace('\n', "\r\n");
        let output = format!("[INFO] Outputting CSR:\r\n{crlf}\r\n[INFO] Finished outputting CSR.\r\n");

        assert_eq!(extract(&output)?, crlf);
        Ok(())
    }

    #[test]
    fn extract_first_of_two() -> anyhow::Result<()> {
        let second = CSR.replace("MIHz", "AAAA");
        let output = format!("{CSR}\n{second}\n");

        assert_eq!(extract(&output)?, CSR);
        Ok(())
    }

    #[test]
    fn no_block() {
        let output = "Creating CSR\nFailed to retrieve a CSR.\nFinished outputting CSR.\n";

        assert_eq!(extract(output), Err(CsrError::NotFound));
    }

    #[test]
    fn missing_footer() {
        let output = "-----BEGIN CERTIFICATE REQUEST-----\nMIHz\nFinished outputting CSR.\n";

        assert_eq!(extract(output), Err(CsrError::NotFound));
    }

    #[test]
    fn empty_body() {
        let output = format!("{BEGIN}\n{END}\n");

        assert_eq!(extract(&output), Err(CsrError::NotFound));
    }

    // A header buried in the middle of a log line is not the start of a block.
    #[test]
    fn header_must_start_a_line() {
        let output = format!("echo: {CSR}\n");

        assert_eq!(extract(&output), Err(CsrError::NotFound));
    }

    // Text interleaved with the base64 body invalidates that candidate, but a later
    // well-formed block is still found.
    #[test]
    fn skips_malformed_candidate() -> anyhow::Result<()> {
        let interleaved = CSR.replace(
            "ZXZpY2Ug",
            "[ERROR] something bad happened\nZXZpY2Ug",
        );
        let output = format!("{interleaved}\nretrying\n{CSR}\n");

        let block = extract(&output)?;
        assert_eq!(block, CSR);
        assert!(!block.contains("ERROR"));
        Ok(())
    }

    #[test]
    fn footer_at_end_of_text() -> anyhow::Result<()> {
        assert_eq!(extract(CSR)?, CSR);
        Ok(())
    }
}
