use jas_core::{Generator, GUIDANCE_RANGE, STEPS_RANGE, DEFAULT_GUIDANCE_SCALE, DEFAULT_STEPS};

const TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>JAS Image Generator</title>
<style>
  body { font-family: sans-serif; background: #1e1e1e; color: #eee; max-width: 720px; margin: 2em auto; }
  input[type=text] { width: 100%; padding: .4em; }
  label { display: block; margin-top: 1em; }
  #status.error { color: #ff7b72; }
  #result img { max-width: 100%; margin-top: 1em; }
  #download { display: none; }
</style>
</head>
<body>
<h1>JAS Image Generator</h1>
<p>Powered by {{BACKEND}}</p>
<label>What do you want to create?
  <input type="text" id="prompt" placeholder="A futuristic city in the clouds">
</label>
<label>Negative prompt (optional)
  <input type="text" id="negative" value="{{NEGATIVE}}">
</label>
<label>Inference steps: <span id="steps-value">{{STEPS}}</span>
  <input type="range" id="steps" min="{{STEPS_MIN}}" max="{{STEPS_MAX}}" step="1" value="{{STEPS}}">
</label>
<label>Guidance scale: <span id="guidance-value">{{GUIDANCE}}</span>
  <input type="range" id="guidance" min="{{GUIDANCE_MIN}}" max="{{GUIDANCE_MAX}}" step="0.5" value="{{GUIDANCE}}">
</label>
<p><button id="generate">Generate Image</button></p>
<p id="status"></p>
<div id="result">
  <img id="image" alt="">
  <p id="caption"></p>
  <a id="download" href="/api/image.png" download="generated_image.png">Download Image</a>
</div>
<script>
const $ = (id) => document.getElementById(id);
for (const id of ["steps", "guidance"]) {
  $(id).addEventListener("input", () => { $(id + "-value").textContent = $(id).value; });
}
function show(state) {
  $("status").textContent = state.status;
  $("status").className = state.ok ? "" : "error";
  if (state.has_image) {
    $("image").src = "/api/image.png?t=" + Date.now();
    $("caption").textContent = "Generated: " + (state.prompt || "");
    $("download").style.display = "inline";
  }
}
$("generate").addEventListener("click", async () => {
  const prompt = $("prompt").value;
  if (!prompt.trim()) { show({ ok: false, status: "Please enter a prompt", has_image: false }); return; }
  $("generate").disabled = true;
  $("status").className = "";
  $("status").textContent = "Generating image... this may take a moment.";
  try {
    const res = await fetch("/api/generate", {
      method: "POST",
      headers: { "Content-Type": "application/json" },
      body: JSON.stringify({
        prompt,
        negative_prompt: $("negative").value,
        steps: Number($("steps").value),
        guidance: Number($("guidance").value),
      }),
    });
    show(await res.json());
  } catch (e) {
    show({ ok: false, status: "Request failed: " + e, has_image: false });
  } finally {
    $("generate").disabled = false;
  }
});
fetch("/api/status").then((r) => r.json()).then(show);
</script>
</body>
</html>
"#;

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn render(generator: &Generator, negative_prompt: &str) -> String {
    TEMPLATE
        .replace("{{BACKEND}}", &escape_attr(&generator.describe()))
        .replace("{{NEGATIVE}}", &escape_attr(negative_prompt))
        .replace("{{STEPS_MIN}}", &STEPS_RANGE.start().to_string())
        .replace("{{STEPS_MAX}}", &STEPS_RANGE.end().to_string())
        .replace("{{STEPS}}", &DEFAULT_STEPS.to_string())
        .replace("{{GUIDANCE_MIN}}", &GUIDANCE_RANGE.start().to_string())
        .replace("{{GUIDANCE_MAX}}", &GUIDANCE_RANGE.end().to_string())
        .replace("{{GUIDANCE}}", &DEFAULT_GUIDANCE_SCALE.to_string())
}
