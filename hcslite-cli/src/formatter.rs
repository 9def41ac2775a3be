//! Table rendering for `list`.

use comfy_table::{Attribute, Cell, ContentArrangement, Table, presets};
use hcslite::ContainerState;

pub fn state_table(states: &[ContainerState]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_NO_BORDERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("ID").add_attribute(Attribute::Bold),
        Cell::new("STATUS").add_attribute(Attribute::Bold),
        Cell::new("PID").add_attribute(Attribute::Bold),
        Cell::new("SANDBOX").add_attribute(Attribute::Bold),
        Cell::new("CREATED").add_attribute(Attribute::Bold),
    ]);

    for state in states {
        let sandbox = if state.is_sandbox {
            "yes".to_string()
        } else {
            state.sandbox_id.clone()
        };
        table.add_row(vec![
            state.id.clone(),
            state.status.to_string(),
            state.shim_pid.to_string(),
            sandbox,
            state.created.format("%Y-%m-%dT%H:%M:%S").to_string(),
        ]);
    }
    table
}
