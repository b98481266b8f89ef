//! Kubernetes resource quantities (`1.3G`, `128Mi`, `850m`, `1e3`) held as
//! signed nano-units. Sub-nano fractions round up.

use std::cmp::Ordering;
use std::fmt;

const NANO: i128 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    BinarySI,
    DecimalSI,
    DecimalExponent,
}

#[derive(Debug, Clone, Copy)]
pub struct Quantity {
    nanos: i128,
    format: Format,
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.nanos == other.nanos
    }
}

impl Eq for Quantity {}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.nanos.cmp(&other.nanos)
    }
}

fn pow10(e: u32) -> Option<i128> {
    10i128.checked_pow(e)
}

fn div_ceil(a: i128, b: i128) -> i128 {
    let q = a / b;
    if a % b != 0 { q + 1 } else { q }
}

impl Quantity {
    pub fn from_int(v: i64) -> Quantity {
        Quantity { nanos: v as i128 * NANO, format: Format::DecimalSI }
    }

    pub fn parse(s: &str) -> Result<Quantity, String> {
        let bad = || format!("quantities must match the regular expression '^([+-]?[0-9.]+)([eEinumkKMGTP]*[-+]?[0-9]*)$': {:?}", s);
        let s = s.trim();
        if s.is_empty() {
            return Err(bad());
        }
        let (neg, rest) = match s.as_bytes()[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };
        let num_end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
        let (num, suffix) = rest.split_at(num_end);
        if num.is_empty() || num == "." || num.matches('.').count() > 1 {
            return Err(bad());
        }
        let (int_part, frac_part) = num.split_once('.').unwrap_or((num, ""));
        let digits = format!("{}{}", int_part, frac_part);
        let mantissa: i128 = digits.trim_start_matches('0').parse::<i128>().or_else(|e| {
            if digits.chars().all(|c| c == '0') { Ok(0) } else { Err(e) }
        }).map_err(|_| bad())?;
        let frac = frac_part.len() as i32;

        enum Mult {
            Bin(u32),
            Dec(i32),
        }
        let (mult, format) = match suffix {
            "Ki" => (Mult::Bin(10), Format::BinarySI),
            "Mi" => (Mult::Bin(20), Format::BinarySI),
            "Gi" => (Mult::Bin(30), Format::BinarySI),
            "Ti" => (Mult::Bin(40), Format::BinarySI),
            "Pi" => (Mult::Bin(50), Format::BinarySI),
            "Ei" => (Mult::Bin(60), Format::BinarySI),
            "n" => (Mult::Dec(-9), Format::DecimalSI),
            "u" => (Mult::Dec(-6), Format::DecimalSI),
            "m" => (Mult::Dec(-3), Format::DecimalSI),
            "" => (Mult::Dec(0), Format::DecimalSI),
            "k" => (Mult::Dec(3), Format::DecimalSI),
            "M" => (Mult::Dec(6), Format::DecimalSI),
            "G" => (Mult::Dec(9), Format::DecimalSI),
            "T" => (Mult::Dec(12), Format::DecimalSI),
            "P" => (Mult::Dec(15), Format::DecimalSI),
            "E" => (Mult::Dec(18), Format::DecimalSI),
            exp if exp.starts_with('e') || exp.starts_with('E') => {
                let e: i32 = exp[1..].parse().map_err(|_| bad())?;
                (Mult::Dec(e), Format::DecimalExponent)
            }
            _ => return Err(bad()),
        };
        let range = || format!("quantity {:?} is out of range", s);
        let magnitude = match mult {
            Mult::Bin(k) => {
                let scaled = mantissa.checked_mul(1i128 << k).and_then(|v| v.checked_mul(NANO)).ok_or_else(range)?;
                div_ceil(scaled, pow10(frac as u32).ok_or_else(range)?)
            }
            Mult::Dec(e) => {
                let scale = 9 + e - frac;
                if scale >= 0 {
                    mantissa.checked_mul(pow10(scale as u32).ok_or_else(range)?).ok_or_else(range)?
                } else {
                    match pow10((-scale) as u32) {
                        Some(d) => div_ceil(mantissa, d),
                        None => i128::from(mantissa != 0),
                    }
                }
            }
        };
        // keep results convertible to i64 units
        if magnitude / NANO > i64::MAX as i128 {
            return Err(range());
        }
        Ok(Quantity { nanos: if neg { -magnitude } else { magnitude }, format })
    }

    pub fn add(&self, other: &Quantity) -> Result<Quantity, String> {
        let nanos = self.nanos.checked_add(other.nanos).ok_or("quantity overflow")?;
        Ok(Quantity { nanos, format: self.format })
    }

    pub fn sub(&self, other: &Quantity) -> Result<Quantity, String> {
        let nanos = self.nanos.checked_sub(other.nanos).ok_or("quantity overflow")?;
        Ok(Quantity { nanos, format: self.format })
    }

    pub fn sign(&self) -> i64 {
        self.nanos.signum() as i64
    }

    pub fn is_integer(&self) -> bool {
        self.nanos % NANO == 0 && i64::try_from(self.nanos / NANO).is_ok()
    }

    pub fn as_integer(&self) -> Result<i64, String> {
        if self.nanos % NANO != 0 {
            return Err(format!("cannot convert value to integer: {} has a fractional part", self));
        }
        i64::try_from(self.nanos / NANO).map_err(|_| format!("cannot convert value to integer: {} overflows", self))
    }

    pub fn as_approximate_float(&self) -> f64 {
        self.nanos as f64 / NANO as f64
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nanos == 0 {
            return f.write_str("0");
        }
        let sign = if self.nanos < 0 { "-" } else { "" };
        let n = self.nanos.abs();
        if n % NANO != 0 {
            let (unit, suffix) = if n % 1_000_000 == 0 {
                (1_000_000, "m")
            } else if n % 1_000 == 0 {
                (1_000, "u")
            } else {
                (1, "n")
            };
            return write!(f, "{}{}{}", sign, n / unit, suffix);
        }
        let units = n / NANO;
        if self.format == Format::BinarySI {
            for (shift, suffix) in [(60, "Ei"), (50, "Pi"), (40, "Ti"), (30, "Gi"), (20, "Mi"), (10, "Ki")] {
                let base = 1i128 << shift;
                if units % base == 0 {
                    return write!(f, "{}{}{}", sign, units / base, suffix);
                }
            }
            return write!(f, "{}{}", sign, units);
        }
        for (exp, suffix) in [(18, "E"), (15, "P"), (12, "T"), (9, "G"), (6, "M"), (3, "k")] {
            let base = 10i128.pow(exp);
            if units % base == 0 {
                return if self.format == Format::DecimalExponent {
                    write!(f, "{}{}e{}", sign, units / base, exp)
                } else {
                    write!(f, "{}{}{}", sign, units / base, suffix)
                };
            }
        }
        write!(f, "{}{}", sign, units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity::parse(s).unwrap()
    }

    #[test]
    fn parses_suffixes_and_rounds_up() {
        assert_eq!(q("1.3G"), Quantity::from_int(1_300_000_000));
        assert_eq!(q("128Mi").as_integer().unwrap(), 128 * 1024 * 1024);
        assert_eq!(q("850m").as_approximate_float(), 0.85);
        assert_eq!(q("1e3"), q("1k"));
        assert_eq!(q("0.5n"), q("1n"));
        assert!(!q("850m").is_integer());
        assert_eq!(q("-2").sign(), -1);
    }

    #[test]
    fn rejects_garbage() {
        for s in ["", "G", "1.2.3", "12Q", "1Gi5"] {
            assert!(Quantity::parse(s).is_err(), "{s}");
        }
    }

    #[test]
    fn arithmetic_and_display() {
        let v = q("1.3G").add(&q("700M")).unwrap().sub(&Quantity::from_int(1)).unwrap();
        assert!(v < q("2G"));
        assert_eq!(q("2048Ki").to_string(), "2Mi");
        assert_eq!(q("1500m").to_string(), "1500m");
        assert_eq!(q("2G").to_string(), "2G");
    }
}
