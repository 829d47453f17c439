/// Prompts offered by the example selector, in display order.
pub const EXAMPLE_PROMPTS: [&str; 5] = [
    "In a shocking finding, scientists discovered a herd of unicorns living in a remote, \
     previously unexplored valley, in the Andes Mountains. Even more surprising to the \
     researchers was the fact that the unicorns spoke perfect English.",
    "The ancient people of Arcadia achieved oustanding cultural and technological \
     developments. Below we summarise some of the highlights of the Acadian society.",
    "Tweet: \"I hate it when my phone battery dies.\"
Sentiment: Negative
###
Tweet: My day has been 👍.
Sentiment: Positive
###
Tweet: This is the link to the article.
Sentiment: Neutral
###
Tweet: This new movie started strange but in the end it was awesome.
Sentiment:",
    "Q: Fetch the departments that have less than five people in it.
A: SELECT DEPARTMENT, COUNT(WOKRED_ID) as \"Number of Workers\" FROM Worker GROUP BY DEPARTMENT HAVING COUNT(WORKED_ID) < 5;
###
Q: Show all departments along with the number of people in each department
A: SELECT DEPARTMENT, COUNT(DEPARTMENT) as \"Number of Workers\" FROM Worker GROUP BY DEPARTMENT;
###
Q: Show the last record of the Worker table
A: SELECT * FROM Worker ORDER BY LAST_NAME DESC LIMIT 1;
###
Q: Fetch the three max salaries from the Worker table;
A:",
    "白日依山尽",
];

/// Position of `prompt` among the examples, 0 when it matches none.
pub fn example_index(prompt: &str) -> usize {
    let prompt = normalize_newlines(prompt);
    EXAMPLE_PROMPTS
        .iter()
        .position(|example| *example == prompt)
        .unwrap_or(0)
}

/// Storytelling prompts sample hot; classification and code prompts cool.
pub fn default_temperature(example: usize) -> f64 {
    if example < 2 { 1.0 } else { 0.35 }
}

/// Browsers submit text areas with CRLF line breaks.
fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n")
}
