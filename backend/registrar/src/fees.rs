//! Registration fee and processing-time tables (amounts in NPR).

use crate::models::CompanyType;

/// Base registration fee charged by company type.
pub fn base_fee(company_type: &CompanyType) -> i64 {
    match company_type {
        CompanyType::Private => 15_000,
        CompanyType::Public => 25_000,
        CompanyType::Partnership => 8_000,
        CompanyType::Sole => 5_000,
        CompanyType::Other(_) => 15_000,
    }
}

/// Surcharge for an optional add-on service. Unknown names cost nothing.
pub fn service_fee(service: &str) -> i64 {
    match service {
        "PAN Registration" => 2_000,
        "VAT Registration" => 3_000,
        "Trademark Registration" => 10_000,
        "Bank Account Opening" => 2_500,
        _ => 0,
    }
}

pub fn compute_fee<'a, I>(company_type: &CompanyType, additional_services: I) -> i64
where
    I: IntoIterator<Item = &'a str>,
{
    additional_services
        .into_iter()
        .map(service_fee)
        .fold(base_fee(company_type), |total, fee| total + fee)
}

/// Working days until the registration is expected to complete.
pub fn estimate_days(company_type: &CompanyType) -> u32 {
    match company_type {
        CompanyType::Private => 10,
        CompanyType::Public => 15,
        CompanyType::Partnership => 7,
        CompanyType::Sole => 5,
        CompanyType::Other(_) => 10,
    }
}
