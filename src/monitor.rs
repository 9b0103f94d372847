//! 编码器进度行的解析。
//!
//! FFmpeg 带 `-progress pipe:1` 时在 stdout 输出 key=value 进度行,
//! 旧版本/不同构建的格式略有差异 (`bitrate=2501.3kbits/s`、
//! `bitrate=  12.5kbits/s`、`bitrate=N/A`), 这里只做尽力而为的提取。
//! 任何一行输出都算一次心跳 —— 解析不出码率不等于卡死,
//! 卡死的判据是完全没有输出。

/// 从一行进度输出中提取码率 (kbps), 提取失败返回 None
pub fn parse_bitrate_kbps(line: &str) -> Option<f64> {
    let idx = line.find("bitrate=")?;
    let rest = line[idx + "bitrate=".len()..].trim_start();
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    rest[..end].parse::<f64>().ok()
}
