use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::Error;

const BINARY_SI: [&str; 6] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];
const DECIMAL_SI: [&str; 10] = ["", "n", "u", "m", "k", "M", "G", "T", "P", "E"];

fn split_number(input: &str) -> (&str, &str) {
    let unsigned = input.strip_prefix(['+', '-']).unwrap_or(input);
    let sign_len = input.len() - unsigned.len();
    let number_len = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    input.split_at(sign_len + number_len)
}

fn valid_number(number: &str) -> bool {
    let digits = number.strip_prefix(['+', '-']).unwrap_or(number);
    match digits.split_once('.') {
        Some((whole, frac)) => {
            !(whole.is_empty() && frac.is_empty())
                && !frac.contains('.')
                && whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit())
        }
        None => !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()),
    }
}

fn valid_suffix(suffix: &str) -> bool {
    if BINARY_SI.contains(&suffix) || DECIMAL_SI.contains(&suffix) {
        return true;
    }
    match suffix.strip_prefix(['e', 'E']) {
        Some(exponent) => {
            let digits = exponent.strip_prefix(['+', '-']).unwrap_or(exponent);
            !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Parses a Kubernetes resource quantity such as `100m`, `128Mi` or `1e3`.
pub fn parse_quantity(value: &str) -> Result<Quantity, Error> {
    let (number, suffix) = split_number(value);
    if !valid_number(number) || !valid_suffix(suffix) {
        return Err(Error::UserInputError(format!(
            "invalid resource quantity '{value}'"
        )));
    }
    Ok(Quantity(value.to_string()))
}
