//! 导入扫描
//!
//! 执行前对源码做一遍词法扫描：找出所有导入形式，拒绝不在白名单中的模块，
//! 并把允许的导入改写为对 `__module` 加载器的调用。字符串、注释、正则字面量中的
//! 内容不会被当作导入。

use std::collections::BTreeSet;

/// 非字面量参数的动态导入
pub(crate) const DYNAMIC_IMPORT: &str = "<dynamic>";

const LOADER: &str = "__module";
const STAR_LOADER: &str = "__import_star";

/// 其后的 `/` 开始一个正则字面量而不是除号
const REGEX_PRECEDING_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case",
    "do", "else", "yield", "await",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ImportViolation {
    /// 模块不在白名单中
    NotAllowed(String),
    /// 导入语句无法解析
    Malformed { line: usize, message: String },
}

/// 模块名本身或其顶层包在白名单中即允许
pub(crate) fn is_module_allowed(module: &str, allowed: &BTreeSet<String>) -> bool {
    if allowed.contains(module) {
        return true;
    }
    module
        .split('.')
        .next()
        .is_some_and(|root| root != module && allowed.contains(root))
}

/// 校验并改写源码中的导入
pub(crate) fn rewrite_imports(
    source: &str,
    allowed: &BTreeSet<String>,
) -> Result<String, ImportViolation> {
    let mut scanner = Scanner::new(source, allowed);
    scanner.scan(false)?;
    Ok(scanner.apply())
}

struct Edit {
    start: usize,
    end: usize,
    replacement: String,
}

struct Scanner<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    allowed: &'a BTreeSet<String>,
    edits: Vec<Edit>,
    at_stmt_start: bool,
    prev: Option<u8>,
    prev_word: Option<&'a str>,
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'$' || b >= 0x80
}

fn is_ident_char(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit()
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn load(module: &str) -> String {
    format!("{}({})", LOADER, js_string(module))
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str, allowed: &'a BTreeSet<String>) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            allowed,
            edits: Vec::new(),
            at_stmt_start: true,
            prev: None,
            prev_word: None,
        }
    }

    fn apply(self) -> String {
        let mut out = String::with_capacity(self.src.len());
        let mut last = 0;
        for edit in &self.edits {
            out.push_str(self.src.get(last..edit.start).unwrap_or_default());
            out.push_str(&edit.replacement);
            last = edit.end;
        }
        out.push_str(self.src.get(last..).unwrap_or_default());
        out
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn line(&self) -> usize {
        self.bytes
            .get(..self.pos)
            .map_or(0, |b| b.iter().filter(|&&c| c == b'\n').count())
            + 1
    }

    fn malformed(&self, message: &str) -> ImportViolation {
        ImportViolation::Malformed {
            line: self.line(),
            message: message.to_string(),
        }
    }

    fn check(&self, module: &str) -> Result<(), ImportViolation> {
        if is_module_allowed(module, self.allowed) {
            Ok(())
        } else {
            Err(ImportViolation::NotAllowed(module.to_string()))
        }
    }

    fn mark(&mut self, b: u8) {
        self.prev = Some(b);
        self.prev_word = None;
        self.at_stmt_start = false;
    }

    fn scan(&mut self, nested: bool) -> Result<(), ImportViolation> {
        let mut depth = 0usize;
        while let Some(b) = self.peek() {
            match b {
                b'\n' => {
                    self.pos += 1;
                    self.at_stmt_start = true;
                }
                b' ' | b'\t' | b'\r' => self.pos += 1,
                b'/' if self.peek_at(1) == Some(b'/') => self.skip_line_comment(),
                b'/' if self.peek_at(1) == Some(b'*') => self.skip_block_comment(),
                b'/' if self.regex_allowed() => {
                    self.skip_regex();
                    self.mark(b'/');
                }
                b'\'' | b'"' => {
                    self.skip_string(b);
                    self.mark(b);
                }
                b'`' => {
                    self.skip_template()?;
                    self.mark(b'`');
                }
                b'{' => {
                    depth += 1;
                    self.pos += 1;
                    self.mark(b);
                    self.at_stmt_start = true;
                }
                b'}' => {
                    self.pos += 1;
                    if nested && depth == 0 {
                        return Ok(());
                    }
                    depth = depth.saturating_sub(1);
                    self.mark(b);
                    self.at_stmt_start = true;
                }
                b';' => {
                    self.pos += 1;
                    self.mark(b);
                    self.at_stmt_start = true;
                }
                b'0'..=b'9' => {
                    while self
                        .peek()
                        .is_some_and(|c| is_ident_char(c) || c == b'.')
                    {
                        self.pos += 1;
                    }
                    self.mark(b'0');
                }
                _ if is_ident_start(b) => {
                    let start = self.pos;
                    let word = self.ident().unwrap_or_default();
                    self.on_word(start, word)?;
                }
                _ => {
                    self.pos += 1;
                    self.mark(b);
                }
            }
        }
        Ok(())
    }

    fn on_word(&mut self, start: usize, word: &'a str) -> Result<(), ImportViolation> {
        let member_access = self.prev == Some(b'.');
        let stmt_start = self.at_stmt_start;
        self.prev = Some(b'a');
        self.prev_word = Some(word);
        self.at_stmt_start = false;

        if member_access {
            return Ok(());
        }
        match word {
            // `{ import: 1 }` 是属性名
            "import" if self.next_inline() != Some(b':') => self.import_statement(start),
            "from" if stmt_start => self.from_statement(start),
            "require" if self.next_inline() == Some(b'(') => self.require_call(start),
            _ => Ok(()),
        }
    }

    fn regex_allowed(&self) -> bool {
        match self.prev {
            None => true,
            Some(b) if is_ident_char(b) || matches!(b, b')' | b']' | b'\'' | b'"' | b'`') => self
                .prev_word
                .is_some_and(|w| REGEX_PRECEDING_KEYWORDS.contains(&w)),
            Some(_) => true,
        }
    }

    fn skip_line_comment(&mut self) {
        while self.peek().is_some_and(|b| b != b'\n') {
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) {
        self.pos += 2;
        while let Some(b) = self.peek() {
            if b == b'*' && self.peek_at(1) == Some(b'/') {
                self.pos += 2;
                return;
            }
            if b == b'\n' {
                self.at_stmt_start = true;
            }
            self.pos += 1;
        }
    }

    fn skip_string(&mut self, quote: u8) {
        self.pos += 1;
        while let Some(b) = self.peek() {
            self.pos += 1;
            match b {
                b'\\' => self.pos += 1,
                b'\n' => return,
                _ if b == quote => return,
                _ => {}
            }
        }
    }

    fn skip_regex(&mut self) {
        self.pos += 1;
        let mut in_class = false;
        while let Some(b) = self.peek() {
            self.pos += 1;
            match b {
                b'\\' => self.pos += 1,
                b'[' => in_class = true,
                b']' => in_class = false,
                b'/' if !in_class => break,
                b'\n' => return,
                _ => {}
            }
        }
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
    }

    /// 模板字符串中的 `${...}` 按普通代码扫描
    fn skip_template(&mut self) -> Result<(), ImportViolation> {
        self.pos += 1;
        while let Some(b) = self.peek() {
            match b {
                b'\\' => self.pos += 2,
                b'`' => {
                    self.pos += 1;
                    return Ok(());
                }
                b'$' if self.peek_at(1) == Some(b'{') => {
                    self.pos += 2;
                    self.prev = None;
                    self.prev_word = None;
                    self.scan(true)?;
                }
                _ => self.pos += 1,
            }
        }
        Ok(())
    }

    fn skip_inline_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r')) {
            self.pos += 1;
        }
    }

    fn skip_ws(&mut self) {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => self.pos += 1,
                Some(b'/') if self.peek_at(1) == Some(b'/') => self.skip_line_comment(),
                Some(b'/') if self.peek_at(1) == Some(b'*') => self.skip_block_comment(),
                _ => return,
            }
        }
    }

    fn next_inline(&self) -> Option<u8> {
        self.bytes
            .get(self.pos..)?
            .iter()
            .copied()
            .find(|b| !matches!(b, b' ' | b'\t' | b'\r'))
    }

    fn ident(&mut self) -> Option<&'a str> {
        let start = self.pos;
        if !self.peek().is_some_and(is_ident_start) {
            return None;
        }
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        self.src.get(start..self.pos)
    }

    fn peek_word(&self) -> Option<&'a str> {
        let mut end = self.pos;
        if !self.bytes.get(end).copied().is_some_and(is_ident_start) {
            return None;
        }
        while self.bytes.get(end).copied().is_some_and(is_ident_char) {
            end += 1;
        }
        self.src.get(self.pos..end)
    }

    fn dotted_name(&mut self) -> Option<String> {
        let mut name = self.ident()?.to_string();
        while self.peek() == Some(b'.') && self.peek_at(1).is_some_and(is_ident_start) {
            self.pos += 1;
            name.push('.');
            name.push_str(self.ident()?);
        }
        Some(name)
    }

    fn string_literal(&mut self) -> Option<String> {
        let quote = self.peek().filter(|b| matches!(b, b'\'' | b'"'))?;
        let start = self.pos + 1;
        let mut end = start;
        loop {
            match self.bytes.get(end).copied()? {
                b'\\' | b'\n' => return None,
                b if b == quote => break,
                _ => end += 1,
            }
        }
        self.pos = end + 1;
        self.src.get(start..end).map(str::to_string)
    }

    fn expect_word(&mut self, word: &str) -> Result<(), ImportViolation> {
        self.skip_ws();
        match self.ident() {
            Some(w) if w == word => Ok(()),
            _ => Err(self.malformed(&format!("expected '{}' in import statement", word))),
        }
    }

    fn expect_ident(&mut self) -> Result<&'a str, ImportViolation> {
        self.ident()
            .ok_or_else(|| self.malformed("expected identifier in import statement"))
    }

    fn module_specifier(&mut self) -> Result<String, ImportViolation> {
        self.skip_ws();
        self.string_literal()
            .ok_or_else(|| self.malformed("expected module name string"))
    }

    fn finish_statement(&mut self, start: usize, replacement: String) {
        self.skip_inline_ws();
        if self.peek() == Some(b';') {
            self.pos += 1;
        }
        self.push_edit(start, replacement);
        self.mark(b';');
        self.at_stmt_start = true;
    }

    /// 保留被替换区间内的换行，行号不变
    fn push_edit(&mut self, start: usize, mut replacement: String) {
        let end = self.pos;
        let newlines = self
            .bytes
            .get(start..end)
            .map_or(0, |b| b.iter().filter(|&&c| c == b'\n').count());
        replacement.push_str(&"\n".repeat(newlines));
        self.edits.push(Edit {
            start,
            end,
            replacement,
        });
    }

    fn import_statement(&mut self, start: usize) -> Result<(), ImportViolation> {
        self.skip_inline_ws();
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                self.skip_ws();
                let module = self
                    .string_literal()
                    .ok_or_else(|| ImportViolation::NotAllowed(DYNAMIC_IMPORT.to_string()))?;
                self.skip_ws();
                if self.peek() != Some(b')') {
                    return Err(ImportViolation::NotAllowed(DYNAMIC_IMPORT.to_string()));
                }
                self.pos += 1;
                self.check(&module)?;
                self.push_edit(start, format!("Promise.resolve({})", load(&module)));
                self.mark(b')');
                Ok(())
            }
            Some(b'\'' | b'"') => {
                let module = self.module_specifier()?;
                self.check(&module)?;
                self.finish_statement(start, format!("{};", load(&module)));
                Ok(())
            }
            Some(b'{') => {
                let bindings = self.named_bindings()?;
                self.expect_word("from")?;
                let module = self.module_specifier()?;
                self.check(&module)?;
                self.finish_statement(start, format!("const {} = {};", bindings, load(&module)));
                Ok(())
            }
            Some(b'*') => {
                self.pos += 1;
                self.expect_word("as")?;
                self.skip_ws();
                let alias = self.expect_ident()?;
                self.expect_word("from")?;
                let module = self.module_specifier()?;
                self.check(&module)?;
                self.finish_statement(start, format!("const {} = {};", alias, load(&module)));
                Ok(())
            }
            Some(b) if is_ident_start(b) => self.import_names(start),
            _ => Err(self.malformed("invalid import statement")),
        }
    }

    /// `import x from "m"`、`import x, {..} from "m"` 或 `import a, b.c as d`
    fn import_names(&mut self, start: usize) -> Result<(), ImportViolation> {
        let mut name = self
            .dotted_name()
            .ok_or_else(|| self.malformed("expected module name"))?;
        self.skip_inline_ws();

        if !name.contains('.') {
            let after_name = self.pos;
            if self.peek_word() == Some("from") {
                self.expect_word("from")?;
                let module = self.module_specifier()?;
                self.check(&module)?;
                self.finish_statement(start, format!("const {} = {};", name, load(&module)));
                return Ok(());
            }
            if self.peek() == Some(b',') {
                self.pos += 1;
                self.skip_ws();
                let rest = match self.peek() {
                    Some(b'{') => Some(self.named_bindings()?),
                    Some(b'*') => {
                        self.pos += 1;
                        self.expect_word("as")?;
                        self.skip_ws();
                        Some(self.expect_ident()?.to_string())
                    }
                    _ => None,
                };
                match rest {
                    Some(rest) => {
                        self.expect_word("from")?;
                        let module = self.module_specifier()?;
                        self.check(&module)?;
                        let loaded = load(&module);
                        self.finish_statement(
                            start,
                            format!("const {} = {}, {} = {};", name, loaded, rest, loaded),
                        );
                        return Ok(());
                    }
                    None => self.pos = after_name,
                }
            }
        }

        let mut decls = Vec::new();
        loop {
            self.check(&name)?;
            self.skip_inline_ws();
            let binding = if self.peek_word() == Some("as") {
                self.expect_word("as")?;
                self.skip_inline_ws();
                self.expect_ident()?.to_string()
            } else {
                name.split('.').next().unwrap_or_default().to_string()
            };
            decls.push(format!("{} = {}", binding, load(&name)));

            self.skip_inline_ws();
            if self.peek() != Some(b',') {
                break;
            }
            self.pos += 1;
            self.skip_inline_ws();
            name = self
                .dotted_name()
                .ok_or_else(|| self.malformed("expected module name"))?;
        }
        self.finish_statement(start, format!("var {};", decls.join(", ")));
        Ok(())
    }

    /// `from m import a, b as c`、`from m import (a, b)`、`from m import *`
    fn from_statement(&mut self, start: usize) -> Result<(), ImportViolation> {
        let resume = self.pos;
        self.skip_inline_ws();
        let module = match self.dotted_name() {
            Some(module) => module,
            None => {
                self.pos = resume;
                return Ok(());
            }
        };
        self.skip_inline_ws();
        if self.peek_word() != Some("import") {
            // `from` 只是普通标识符
            self.pos = resume;
            return Ok(());
        }
        self.expect_word("import")?;
        self.check(&module)?;
        self.skip_inline_ws();

        if self.peek() == Some(b'*') {
            self.pos += 1;
            self.finish_statement(
                start,
                format!("{}({});", STAR_LOADER, load(&module)),
            );
            return Ok(());
        }

        let parenthesized = self.peek() == Some(b'(');
        if parenthesized {
            self.pos += 1;
        }
        let mut names = Vec::new();
        loop {
            if parenthesized {
                self.skip_ws();
                if self.peek() == Some(b')') {
                    self.pos += 1;
                    break;
                }
            } else {
                self.skip_inline_ws();
            }
            let name = self.expect_ident()?;
            self.skip_inline_ws();
            if self.peek_word() == Some("as") {
                self.expect_word("as")?;
                self.skip_inline_ws();
                let alias = self.expect_ident()?;
                names.push(format!("{}: {}", name, alias));
            } else {
                names.push(name.to_string());
            }
            if parenthesized {
                self.skip_ws();
            } else {
                self.skip_inline_ws();
            }
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b')') if parenthesized => {
                    self.pos += 1;
                    break;
                }
                _ if !parenthesized => break,
                _ => return Err(self.malformed("expected ',' or ')' in import list")),
            }
        }
        if names.is_empty() {
            return Err(self.malformed("empty import list"));
        }
        self.finish_statement(
            start,
            format!("var {{{}}} = {};", names.join(", "), load(&module)),
        );
        Ok(())
    }

    /// `{ a, b as c }` -> `{a, b: c}`
    fn named_bindings(&mut self) -> Result<String, ImportViolation> {
        self.pos += 1;
        let mut names = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(b'}') {
                self.pos += 1;
                break;
            }
            let name = self.expect_ident()?;
            self.skip_ws();
            if self.peek_word() == Some("as") {
                self.expect_word("as")?;
                self.skip_ws();
                let alias = self.expect_ident()?;
                names.push(format!("{}: {}", name, alias));
            } else {
                names.push(name.to_string());
            }
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(self.malformed("expected ',' or '}' in import list")),
            }
        }
        Ok(format!("{{{}}}", names.join(", ")))
    }

    fn require_call(&mut self, start: usize) -> Result<(), ImportViolation> {
        self.skip_inline_ws();
        self.pos += 1;
        self.skip_ws();
        let module = self
            .string_literal()
            .ok_or_else(|| ImportViolation::NotAllowed(DYNAMIC_IMPORT.to_string()))?;
        self.skip_ws();
        if self.peek() != Some(b')') {
            return Err(ImportViolation::NotAllowed(DYNAMIC_IMPORT.to_string()));
        }
        self.pos += 1;
        self.check(&module)?;
        self.push_edit(start, load(&module));
        self.mark(b')');
        Ok(())
    }
}
