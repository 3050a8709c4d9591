use qdelectra_distill::Task;

pub fn run() {
    println!("{:<8} {:<15} {:>7} {:>8}  LABELS", "TASK", "MODE", "EPOCHS", "MAX_LEN");
    for task in Task::ALL {
        let spec = task.spec();
        let labels = if spec.labels.is_empty() { "-".to_string() } else { spec.labels.join(",") };
        println!(
            "{:<8} {:<15} {:>7} {:>8}  {}",
            task.as_str(),
            spec.output_mode.as_str(),
            spec.n_epochs,
            spec.max_len,
            labels
        );
    }
}
