//! Rendering of `.tmpl` documents.
//!
//! Templates use Go template action syntax: `{{ env "USER" | lower }}`,
//! `{{ if ... }}...{{ else }}...{{ end }}`, `{{ range .Items }}` and the
//! `{{-`/`-}}` whitespace trimmers. Actions are rewritten into handlebars
//! expressions before rendering, a pipeline stage passing its value as the
//! last argument of the next stage.
use std::sync::OnceLock;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use handlebars::{
	handlebars_helper, no_escape, Context, Handlebars, Helper, HelperResult, Output, RenderContext,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use super::Error;

/// The tail of a `DOMAIN\user` name after the last backslash.
#[must_use]
pub fn extract_username(name: &str) -> &str {
	name.rsplit_once('\\').map_or(name, |(_, user)| user)
}

/// Whether a value counts as empty for `default`.
fn is_empty(value: &Value) -> bool {
	match value {
		Value::Null => true,
		Value::Bool(b) => !b,
		Value::Number(n) => n.as_f64() == Some(0.0),
		Value::String(s) => s.is_empty(),
		Value::Array(items) => items.is_empty(),
		Value::Object(map) => map.is_empty(),
	}
}

handlebars_helper!(env: |name: str| std::env::var(name).unwrap_or_default());
handlebars_helper!(extract_username_helper: |name: str| extract_username(name).to_owned());
handlebars_helper!(upper: |s: str| s.to_uppercase());
handlebars_helper!(lower: |s: str| s.to_lowercase());
handlebars_helper!(trim: |s: str| s.trim().to_owned());
handlebars_helper!(default: |fallback: Json, value: Json| {
	if is_empty(value) { fallback.clone() } else { value.clone() }
});
handlebars_helper!(quote: |s: str| Value::String(s.to_owned()).to_string());
handlebars_helper!(replace: |old: str, new: str, s: str| s.replace(old, new));
handlebars_helper!(contains: |needle: str, s: str| s.contains(needle));
handlebars_helper!(has_prefix: |prefix: str, s: str| s.starts_with(prefix));
handlebars_helper!(has_suffix: |suffix: str, s: str| s.ends_with(suffix));
handlebars_helper!(b64enc: |s: str| STANDARD.encode(s));
handlebars_helper!(b64dec: |s: str| {
	STANDARD.decode(s).ok().and_then(|bytes| String::from_utf8(bytes).ok()).unwrap_or_default()
});
handlebars_helper!(sha256sum: |s: str| hex::encode(Sha256::digest(s.as_bytes())));

/// A random version 4 UUID.
fn uuidv4(
	_: &Helper,
	_: &Handlebars,
	_: &Context,
	_: &mut RenderContext,
	out: &mut dyn Output,
) -> HelperResult {
	out.write(&uuid::Uuid::new_v4().to_string())?;
	Ok(())
}

/// The current time in RFC 3339 format.
fn now(
	_: &Helper,
	_: &Handlebars,
	_: &Context,
	_: &mut RenderContext,
	out: &mut dyn Output,
) -> HelperResult {
	out.write(&OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default())?;
	Ok(())
}

/// The shared renderer with every helper registered.
fn renderer() -> &'static Handlebars<'static> {
	static RENDERER: OnceLock<Handlebars<'static>> = OnceLock::new();
	RENDERER.get_or_init(|| {
		let mut hb = Handlebars::new();
		hb.register_escape_fn(no_escape);
		hb.register_helper("env", Box::new(env));
		hb.register_helper("extractUsername", Box::new(extract_username_helper));
		hb.register_helper("upper", Box::new(upper));
		hb.register_helper("lower", Box::new(lower));
		hb.register_helper("trim", Box::new(trim));
		hb.register_helper("default", Box::new(default));
		hb.register_helper("quote", Box::new(quote));
		hb.register_helper("replace", Box::new(replace));
		hb.register_helper("contains", Box::new(contains));
		hb.register_helper("hasPrefix", Box::new(has_prefix));
		hb.register_helper("hasSuffix", Box::new(has_suffix));
		hb.register_helper("b64enc", Box::new(b64enc));
		hb.register_helper("b64dec", Box::new(b64dec));
		hb.register_helper("sha256sum", Box::new(sha256sum));
		hb.register_helper("uuidv4", Box::new(uuidv4));
		hb.register_helper("now", Box::new(now));
		hb
	})
}

/// Render a template source.
pub fn render(source: &str) -> Result<String, Error> {
	let translated = translate(source)?;
	renderer()
		.render_template(&translated, &serde_json::json!({}))
		.map_err(|err| Error::Template(err.to_string()))
}

/// An open block action.
#[derive(Debug)]
struct Block {
	/// Handlebars block helper closing this block.
	helper: &'static str,
	/// Nested `#if` blocks opened by `else if` branches.
	chained: usize,
}

/// Rewrite Go template actions into handlebars syntax.
fn translate(source: &str) -> Result<String, Error> {
	let mut out = String::with_capacity(source.len());
	let mut blocks: Vec<Block> = Vec::new();
	let mut rest = source;

	while let Some(start) = rest.find("{{") {
		out.push_str(&rest[..start]);
		let after = &rest[start + 2..];
		let unterminated =
			|| Error::Template(format!("unterminated action at {:?}", &rest[start..]));
		let end = action_end(after).ok_or_else(unterminated)?;
		let mut action = &after[..end];
		rest = &after[end + 2..];

		let trim_left = action.starts_with('-') && action[1..].starts_with(char::is_whitespace);
		if trim_left {
			action = &action[1..];
		}
		let trim_right =
			action.ends_with('-') && action[..action.len() - 1].ends_with(char::is_whitespace);
		if trim_right {
			action = &action[..action.len() - 1];
		}
		let action = action.trim();
		let open = if trim_left { "{{~" } else { "{{" };
		let close = if trim_right { "~}}" } else { "}}" };

		if action.starts_with("/*") {
			continue;
		}
		let (keyword, argument) = match action.split_once(char::is_whitespace) {
			Some((keyword, argument)) => (keyword, argument.trim()),
			None => (action, ""),
		};
		match keyword {
			"if" | "with" | "range" => {
				let helper = match keyword {
					"if" => "if",
					"with" => "with",
					_ => "each",
				};
				out.push_str(&format!("{open}#{helper} {}{close}", argument_expression(argument)?));
				blocks.push(Block { helper, chained: 0 });
			}
			"else" => {
				let block = blocks
					.last_mut()
					.ok_or_else(|| Error::Template("unexpected {{else}}".to_owned()))?;
				out.push_str(&format!("{open}else{close}"));
				if let Some(condition) = argument.strip_prefix("if") {
					let condition = argument_expression(condition.trim())?;
					out.push_str(&format!("{{{{#if {condition}}}}}"));
					block.chained += 1;
				}
			}
			"end" => {
				let block =
					blocks.pop().ok_or_else(|| Error::Template("unexpected {{end}}".to_owned()))?;
				for _ in 0..block.chained {
					out.push_str("{{/if}}");
				}
				out.push_str(&format!("{open}/{}{close}", block.helper));
			}
			_ => out.push_str(&format!("{open}{}{close}", pipeline(action)?.0)),
		}
	}
	out.push_str(rest);

	if let Some(block) = blocks.last() {
		return Err(Error::Template(format!("unclosed {{{{{}}}}} block", block.helper)));
	}
	Ok(out)
}

/// Offset of the `}}` closing an action, skipping quoted strings.
fn action_end(action: &str) -> Option<usize> {
	let bytes = action.as_bytes();
	let mut i = 0;
	while i < bytes.len() {
		match bytes[i] {
			b'"' => i = closing_quote(bytes, i)?,
			b'`' => i = i + 1 + bytes[i + 1..].iter().position(|b| *b == b'`')?,
			b'}' if bytes.get(i + 1) == Some(&b'}') => return Some(i),
			_ => {}
		}
		i += 1;
	}
	None
}

/// Offset of the quote closing the string opened at `start`.
fn closing_quote(bytes: &[u8], start: usize) -> Option<usize> {
	let mut i = start + 1;
	while i < bytes.len() {
		match bytes[i] {
			b'\\' => i += 1,
			b'"' => return Some(i),
			_ => {}
		}
		i += 1;
	}
	None
}

/// Translate the argument of a block action, parenthesizing helper calls.
fn argument_expression(argument: &str) -> Result<String, Error> {
	let (expression, words) = pipeline(argument)?;
	Ok(if words > 1 { format!("({expression})") } else { expression })
}

/// A lexical element of an action.
#[derive(Debug)]
enum Token {
	/// A translated word, literal, or parenthesized expression.
	Word(String),
	/// The `|` pipeline separator.
	Pipe,
}

/// Translate a pipeline, returning the expression and its word count.
fn pipeline(source: &str) -> Result<(String, usize), Error> {
	let tokens = tokenize(source)?;
	let mut expression: Option<(String, usize)> = None;
	for stage in tokens.split(|token| matches!(token, Token::Pipe)) {
		let mut words: Vec<String> = stage
			.iter()
			.filter_map(|token| match token {
				Token::Word(word) => Some(word.clone()),
				Token::Pipe => None,
			})
			.collect();
		if words.is_empty() {
			return Err(Error::Template(format!("empty pipeline stage in {source:?}")));
		}
		if let Some((previous, count)) = expression.take() {
			words.push(if count > 1 { format!("({previous})") } else { previous });
		}
		let count = words.len();
		expression = Some((words.join(" "), count));
	}
	expression.ok_or_else(|| Error::Template("missing value for command".to_owned()))
}

/// Split an action into words and pipes.
fn tokenize(source: &str) -> Result<Vec<Token>, Error> {
	let bytes = source.as_bytes();
	let unterminated = || Error::Template(format!("unterminated expression {source:?}"));
	let mut tokens = Vec::new();
	let mut i = 0;
	while i < bytes.len() {
		match bytes[i] {
			b if b.is_ascii_whitespace() => i += 1,
			b'|' => {
				tokens.push(Token::Pipe);
				i += 1;
			}
			b'"' => {
				let end = closing_quote(bytes, i).ok_or_else(unterminated)?;
				tokens.push(Token::Word(source[i..=end].to_owned()));
				i = end + 1;
			}
			b'`' => {
				let end = bytes[i + 1..].iter().position(|b| *b == b'`').ok_or_else(unterminated)?;
				let raw = &source[i + 1..i + 1 + end];
				tokens.push(Token::Word(Value::String(raw.to_owned()).to_string()));
				i += end + 2;
			}
			b'(' => {
				let end = closing_paren(bytes, i).ok_or_else(unterminated)?;
				let (inner, _) = pipeline(&source[i + 1..end])?;
				tokens.push(Token::Word(format!("({inner})")));
				i = end + 1;
			}
			b')' => return Err(Error::Template(format!("unexpected ')' in {source:?}"))),
			_ => {
				let start = i;
				while i < bytes.len()
					&& !bytes[i].is_ascii_whitespace()
					&& !matches!(bytes[i], b'|' | b'(' | b')' | b'"')
				{
					i += 1;
				}
				tokens.push(Token::Word(field(&source[start..i])));
			}
		}
	}
	Ok(tokens)
}

/// Offset of the parenthesis closing the one opened at `start`.
fn closing_paren(bytes: &[u8], start: usize) -> Option<usize> {
	let mut depth = 0usize;
	let mut i = start;
	while i < bytes.len() {
		match bytes[i] {
			b'"' => i = closing_quote(bytes, i)?,
			b'(' => depth += 1,
			b')' => {
				depth -= 1;
				if depth == 0 {
					return Some(i);
				}
			}
			_ => {}
		}
		i += 1;
	}
	None
}

/// Translate a field reference: `.` is the current value, `.Name` a field
/// of it and `$.Name` a field of the root.
fn field(word: &str) -> String {
	if word == "." {
		"this".to_owned()
	} else if let Some(path) = word.strip_prefix("$.") {
		format!("@root.{path}")
	} else if let Some(path) = word.strip_prefix('.') {
		path.to_owned()
	} else {
		word.to_owned()
	}
}
