const PREFIXES: [&str; 8] = ["", "K", "M", "G", "T", "P", "E", "Z"];

/// Formats a byte count with a binary prefix: `512`, `4K`, `1.5M`.
///
/// One decimal is shown unless the scaled value is a whole number.
pub fn number_in_binary_units(n: u64) -> String {
    let mut value = n as f64;
    let mut prefix = "Y";

    for p in PREFIXES.iter() {
        if value < 1024.0 {
            prefix = p;
            break;
        }
        value /= 1024.0;
    }

    if value.fract() == 0.0 {
        format!("{:.0}{}", value, prefix)
    } else {
        format!("{:.1}{}", value, prefix)
    }
}
