mod console;

use core::fmt::{self, Write};

pub use console::{ConsoleWriter, Sink};

pub fn init(sink: Sink) {
    console::init(sink);
}

pub fn detach() {
    console::detach();
}

pub fn info(msg: &str) {
    console::write_prefixed_line("[INFO] ", msg);
}

pub fn error(msg: &str) {
    console::write_prefixed_line("[ERROR] ", msg);
}

/// ユーザ env からの sys_cputs をそのまま流す（prefix なし）
pub fn raw(msg: &str) {
    console::write_str(msg);
}

pub fn info_u64(label: &str, value: u64) {
    info_kv(label, value);
}

pub fn info_kv(key: &str, value: u64) {
    let mut buf = [0u8; 21];
    let s = u64_to_decimal(value, &mut buf);

    console::write_str("[INFO] ");
    if !key.is_empty() {
        console::write_str(key);
        console::write_str(" = ");
    }
    console::write_line(s);
}

pub fn info_hex(key: &str, value: u64) {
    info_fmt(format_args!("{} = {:#x}", key, value));
}

pub fn info_fmt(args: fmt::Arguments<'_>) {
    console::write_str("[INFO] ");
    let _ = ConsoleWriter.write_fmt(args);
    console::write_str("\n");
}

fn u64_to_decimal(mut value: u64, buf: &mut [u8; 21]) -> &str {
    if value == 0 {
        let last = buf.len() - 1;
        buf[last] = b'0';
        return core::str::from_utf8(&buf[last..]).unwrap_or("0");
    }

    let mut i = buf.len();
    while value > 0 {
        let digit = (value % 10) as u8;
        i -= 1;
        buf[i] = b'0' + digit;
        value /= 10;
    }

    core::str::from_utf8(&buf[i..]).unwrap_or("?")
}
