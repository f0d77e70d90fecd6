use std::io::Write;

use serde::Serialize;

use super::domain::AdoptionRequest;

#[derive(Serialize)]
struct RequestRow<'a> {
    id: i64,
    pet_id: i64,
    status: &'static str,
    created_at: String,
    name: &'a str,
    email: &'a str,
    phone: &'a str,
    address: &'a str,
    experience: &'a str,
    message: &'a str,
}

const HEADER: [&str; 10] = [
    "id",
    "pet_id",
    "status",
    "created_at",
    "name",
    "email",
    "phone",
    "address",
    "experience",
    "message",
];

/// Writes requests as CSV in the order given. The header row is written even when empty.
pub fn write_requests_csv<W: Write>(
    writer: W,
    requests: &[AdoptionRequest],
) -> Result<(), csv::Error> {
    let mut csv = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    csv.write_record(HEADER)?;
    for request in requests {
        csv.serialize(RequestRow {
            id: request.id.0,
            pet_id: request.animal_id.0,
            status: request.status.label(),
            created_at: request.created_at.to_rfc3339(),
            name: &request.applicant.name,
            email: &request.applicant.email,
            phone: &request.applicant.phone,
            address: &request.applicant.address,
            experience: &request.applicant.experience,
            message: &request.applicant.message,
        })?;
    }
    csv.flush()?;
    Ok(())
}
