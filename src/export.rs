//! CSV formatting for member and attendance exports. Pure string building;
//! the exchange handler fetches rows and writes the file.

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct MemberCsvRow {
    pub id: String,
    pub last_name: String,
    pub first_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub cell_group: Option<String>,
    pub is_active: bool,
}

pub fn members_csv(rows: &[MemberCsvRow]) -> String {
    let mut csv = String::from("id,lastName,firstName,email,phone,cellGroup,isActive\n");
    for row in rows {
        csv.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            csv_quote(&row.id),
            csv_quote(&row.last_name),
            csv_quote(&row.first_name),
            csv_quote(row.email.as_deref().unwrap_or("")),
            csv_quote(row.phone.as_deref().unwrap_or("")),
            csv_quote(row.cell_group.as_deref().unwrap_or("")),
            if row.is_active { "1" } else { "0" },
        ));
    }
    csv
}

#[derive(Debug, Clone)]
pub struct AttendanceCsvRow {
    pub member_id: String,
    pub member_name: String,
    pub status: String,
    pub recorded_at: String,
}

pub fn attendance_csv(event_name: &str, event_date: &str, rows: &[AttendanceCsvRow]) -> String {
    let mut csv = String::from("eventName,eventDate,memberId,memberName,status,recordedAt\n");
    for row in rows {
        csv.push_str(&format!(
            "{},{},{},{},{},{}\n",
            csv_quote(event_name),
            csv_quote(event_date),
            csv_quote(&row.member_id),
            csv_quote(&row.member_name),
            csv_quote(&row.status),
            csv_quote(&row.recorded_at),
        ));
    }
    csv
}
